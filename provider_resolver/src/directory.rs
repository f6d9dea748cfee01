use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::common::now_unix_seconds;
use crate::db::Database;
use crate::error::DirectoryError;
use crate::geo::{bounding_box, distance_m};
use crate::model::{Address, GeoPoint, Location, ProviderRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    pub created: bool,
    /// False when the fragment carried nothing the record did not already hold.
    pub changed: bool,
}

/// Provider records keyed by NPI. Every mutation is a single transaction on
/// the shared connection, so concurrent upserts of one NPI cannot lose
/// each other's additions.
#[derive(Clone)]
pub struct ProviderDirectory {
    db: Database,
}

impl ProviderDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, npi: &str) -> Result<Option<ProviderRecord>, DirectoryError> {
        let conn = self.db.lock().await;
        load_record(&conn, npi)
    }

    pub async fn find_by_name_and_specialty(
        &self,
        first_name: &str,
        last_name: &str,
        specialty: &str,
    ) -> Result<Vec<ProviderRecord>, DirectoryError> {
        let conn = self.db.lock().await;
        let npis = {
            let mut stmt = conn.prepare(
                "
                SELECT p.npi
                FROM providers p
                JOIN provider_specialties s ON s.npi = p.npi
                WHERE p.first_name = ?1 AND p.last_name = ?2 AND s.specialty = ?3
                ORDER BY p.npi
                ",
            )?;
            let rows = stmt.query_map(params![first_name, last_name, specialty], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut out = Vec::with_capacity(npis.len());
        for npi in &npis {
            if let Some(record) = load_record(&conn, npi)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub async fn upsert(&self, fragment: &ProviderRecord) -> Result<UpsertResult, DirectoryError> {
        validate_fragment(fragment)?;

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let (merged, created, changed) = match load_record(&tx, &fragment.npi)? {
            Some(mut record) => {
                let changed = record.merge(fragment);
                (record, false, changed)
            }
            None => {
                let mut record = ProviderRecord::new(
                    fragment.npi.trim(),
                    fragment.first_name.trim(),
                    fragment.last_name.trim(),
                );
                record.merge(fragment);
                (record, true, true)
            }
        };

        if changed {
            write_record(&tx, &merged)?;
        }
        tx.commit()?;

        if created {
            info!(npi = %merged.npi, "Created provider record");
        } else if changed {
            debug!(npi = %merged.npi, "Enriched provider record");
        }
        Ok(UpsertResult { created, changed })
    }

    /// Returns false when no record exists for `npi`.
    pub async fn add_insurances(
        &self,
        npi: &str,
        insurance_ids: &BTreeSet<i64>,
    ) -> Result<bool, DirectoryError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let exists = tx
            .query_row("SELECT 1 FROM providers WHERE npi = ?1", [npi], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Ok(false);
        }
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO provider_insurances (npi, insurance_id) VALUES (?1, ?2)",
            )?;
            for id in insurance_ids {
                stmt.execute(params![npi, id])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Providers with a geocoded location within `max_distance_m` of `point`
    /// that list `specialty` and accept `insurance_id`, nearest first. Each
    /// provider appears once, at the distance of its closest location.
    pub async fn find_near(
        &self,
        point: GeoPoint,
        max_distance_m: f64,
        specialty: &str,
        insurance_id: i64,
    ) -> Result<Vec<(ProviderRecord, f64)>, DirectoryError> {
        if !point.lat.is_finite() || !point.lng.is_finite() || point.lat.abs() > 90.0 {
            return Err(DirectoryError::InvalidSearch(format!(
                "invalid point ({}, {})",
                point.lat, point.lng
            )));
        }
        if !max_distance_m.is_finite() || max_distance_m < 0.0 {
            return Err(DirectoryError::InvalidSearch(format!(
                "invalid max distance {max_distance_m}"
            )));
        }

        let ((lat_lo, lat_hi), lng_range) = bounding_box(point, max_distance_m);
        let (lng_lo, lng_hi) = lng_range.unwrap_or((-180.0, 180.0));

        let conn = self.db.lock().await;
        let mut nearest: BTreeMap<String, f64> = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "
                SELECT l.npi, l.lat, l.lng
                FROM provider_locations l
                JOIN provider_specialties s ON s.npi = l.npi
                JOIN provider_insurances i ON i.npi = l.npi
                WHERE s.specialty = ?1
                  AND i.insurance_id = ?2
                  AND l.lat IS NOT NULL AND l.lng IS NOT NULL
                  AND l.lat BETWEEN ?3 AND ?4
                  AND l.lng BETWEEN ?5 AND ?6
                ",
            )?;
            let rows = stmt.query_map(
                params![specialty, insurance_id, lat_lo, lat_hi, lng_lo, lng_hi],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )?;
            for row in rows {
                let (npi, lat, lng) = row?;
                let distance = distance_m(point, GeoPoint { lat, lng });
                if distance > max_distance_m {
                    continue;
                }
                nearest
                    .entry(npi)
                    .and_modify(|d| *d = d.min(distance))
                    .or_insert(distance);
            }
        }

        let mut ranked: Vec<(String, f64)> = nearest.into_iter().collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut out = Vec::with_capacity(ranked.len());
        for (npi, distance) in ranked {
            if let Some(record) = load_record(&conn, &npi)? {
                out.push((record, distance));
            }
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<usize, DirectoryError> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM providers", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn validate_fragment(fragment: &ProviderRecord) -> Result<(), DirectoryError> {
    if fragment.npi.trim().is_empty() {
        return Err(DirectoryError::InvalidRecord("missing npi".to_string()));
    }
    if fragment.first_name.trim().is_empty() || fragment.last_name.trim().is_empty() {
        return Err(DirectoryError::InvalidRecord(format!(
            "provider {} is missing a first or last name",
            fragment.npi
        )));
    }
    Ok(())
}

fn load_record(conn: &Connection, npi: &str) -> Result<Option<ProviderRecord>, DirectoryError> {
    let record = conn
        .query_row(
            "
            SELECT npi, first_name, last_name, degree, email, phone_number
            FROM providers
            WHERE npi = ?1
            ",
            [npi],
            |row| {
                Ok(ProviderRecord {
                    npi: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    degree: row.get(3)?,
                    email: row.get(4)?,
                    phone_number: row.get(5)?,
                    specialties: BTreeSet::new(),
                    locations: Vec::new(),
                    insurances: BTreeSet::new(),
                })
            },
        )
        .optional()?;
    let Some(mut record) = record else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare("SELECT specialty FROM provider_specialties WHERE npi = ?1 ORDER BY specialty")?;
    for specialty in stmt.query_map([npi], |row| row.get::<_, String>(0))? {
        record.specialties.insert(specialty?);
    }

    let mut stmt = conn.prepare(
        "
        SELECT street, city, state, zip_code, lat, lng
        FROM provider_locations
        WHERE npi = ?1
        ORDER BY rowid
        ",
    )?;
    let locations = stmt.query_map([npi], |row| {
        let lat: Option<f64> = row.get(4)?;
        let lng: Option<f64> = row.get(5)?;
        Ok(Location {
            address: Address {
                street: row.get(0)?,
                city: row.get(1)?,
                state: row.get(2)?,
                zip_code: row.get(3)?,
            },
            coordinates: lat.zip(lng).map(|(lat, lng)| GeoPoint { lat, lng }),
        })
    })?;
    for location in locations {
        record.locations.push(location?);
    }

    let mut stmt = conn.prepare(
        "SELECT insurance_id FROM provider_insurances WHERE npi = ?1 ORDER BY insurance_id",
    )?;
    for insurance in stmt.query_map([npi], |row| row.get::<_, i64>(0))? {
        record.insurances.insert(insurance?);
    }

    Ok(Some(record))
}

fn write_record(conn: &Connection, record: &ProviderRecord) -> Result<(), DirectoryError> {
    let now = now_unix_seconds();
    conn.execute(
        "
        INSERT INTO providers
            (npi, first_name, last_name, degree, email, phone_number, created_at_unix, updated_at_unix)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        ON CONFLICT(npi) DO UPDATE SET
            degree = excluded.degree,
            email = excluded.email,
            phone_number = excluded.phone_number,
            updated_at_unix = excluded.updated_at_unix
        ",
        params![
            record.npi,
            record.first_name,
            record.last_name,
            record.degree,
            record.email,
            record.phone_number,
            now
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO provider_specialties (npi, specialty) VALUES (?1, ?2)",
    )?;
    for specialty in &record.specialties {
        stmt.execute(params![record.npi, specialty])?;
    }

    let mut stmt = conn.prepare(
        "
        INSERT INTO provider_locations (npi, street, city, state, zip_code, lat, lng)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(npi, street, city, state, zip_code) DO UPDATE SET
            lat = COALESCE(provider_locations.lat, excluded.lat),
            lng = COALESCE(provider_locations.lng, excluded.lng)
        ",
    )?;
    for location in &record.locations {
        let a = &location.address;
        stmt.execute(params![
            record.npi,
            a.street,
            a.city,
            a.state,
            a.zip_code,
            location.coordinates.map(|c| c.lat),
            location.coordinates.map(|c| c.lng),
        ])?;
    }

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO provider_insurances (npi, insurance_id) VALUES (?1, ?2)",
    )?;
    for insurance in &record.insurances {
        stmt.execute(params![record.npi, insurance])?;
    }
    Ok(())
}
