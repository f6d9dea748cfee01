use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::common::clean;
use crate::geo::normalize_zip5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

impl Address {
    /// Canonical form used as the set key for provider locations.
    pub fn normalized(&self) -> Self {
        let zip = self.zip_code.trim();
        Self {
            street: self.street.trim().to_string(),
            city: self.city.trim().to_string(),
            state: self.state.trim().to_ascii_uppercase(),
            zip_code: normalize_zip5(zip).unwrap_or_else(|| zip.to_string()),
        }
    }

    pub fn one_line(&self) -> String {
        format!(
            "{}, {}, {}, {}, US",
            self.street, self.city, self.state, self.zip_code
        )
    }

    pub fn city(&self) -> Option<&str> {
        Some(self.city.trim()).filter(|v| !v.is_empty())
    }

    pub fn state(&self) -> Option<&str> {
        Some(self.state.trim()).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(flatten)]
    pub address: Address,
    pub coordinates: Option<GeoPoint>,
}

impl Location {
    pub fn new(address: Address, coordinates: Option<GeoPoint>) -> Self {
        Self {
            address: address.normalized(),
            coordinates,
        }
    }
}

/// A provider as held by the directory. Also used as the fragment passed to
/// `ProviderDirectory::upsert`, where only the populated fields matter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub npi: String,
    pub first_name: String,
    pub last_name: String,
    pub degree: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    #[serde(default)]
    pub specialties: BTreeSet<String>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub insurances: BTreeSet<i64>,
}

impl ProviderRecord {
    pub fn new(
        npi: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            npi: npi.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            degree: None,
            email: None,
            phone_number: None,
            specialties: BTreeSet::new(),
            locations: Vec::new(),
            insurances: BTreeSet::new(),
        }
    }

    pub fn location_is_geocoded(&self, address: &Address) -> bool {
        let key = address.normalized();
        self.locations
            .iter()
            .any(|l| l.address == key && l.coordinates.is_some())
    }

    /// Folds `fragment` into this record and reports whether anything changed.
    ///
    /// Sets are unioned, contact fields take the fragment's value when it has
    /// one, names stay as first written and a missing degree may be filled.
    pub fn merge(&mut self, fragment: &ProviderRecord) -> bool {
        let mut changed = false;

        if self.degree.is_none() && fragment.degree.is_some() {
            self.degree = fragment.degree.clone();
            changed = true;
        }
        if fragment.email.is_some() && fragment.email != self.email {
            self.email = fragment.email.clone();
            changed = true;
        }
        if fragment.phone_number.is_some() && fragment.phone_number != self.phone_number {
            self.phone_number = fragment.phone_number.clone();
            changed = true;
        }

        for specialty in &fragment.specialties {
            changed |= self.specialties.insert(specialty.clone());
        }
        for insurance in &fragment.insurances {
            changed |= self.insurances.insert(*insurance);
        }

        for incoming in &fragment.locations {
            let key = incoming.address.normalized();
            match self.locations.iter_mut().find(|l| l.address == key) {
                Some(existing) => {
                    if existing.coordinates.is_none() && incoming.coordinates.is_some() {
                        existing.coordinates = incoming.coordinates;
                        changed = true;
                    }
                }
                None => {
                    self.locations
                        .push(Location::new(key, incoming.coordinates));
                    changed = true;
                }
            }
        }

        changed
    }
}

/// Provider signals extracted from a document, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionQuery {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub degree: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub npi: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub location: Option<Address>,
}

impl ResolutionQuery {
    pub fn named(first_name: &str, last_name: &str) -> Self {
        Self {
            first_name: Some(first_name.to_string()),
            last_name: Some(last_name.to_string()),
            ..Self::default()
        }
    }

    pub fn with_specialty(mut self, specialty: &str) -> Self {
        self.specialty = Some(specialty.to_string());
        self
    }

    pub fn with_location(mut self, location: Address) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_npi(mut self, npi: &str) -> Self {
        self.npi = Some(npi.to_string());
        self
    }

    /// Trimmed copy with blank fields dropped. An address with nothing but
    /// blanks is dropped as a whole.
    pub fn normalized(&self) -> Self {
        let location = self
            .location
            .as_ref()
            .map(Address::normalized)
            .filter(|a| {
                !(a.street.is_empty()
                    && a.city.is_empty()
                    && a.state.is_empty()
                    && a.zip_code.is_empty())
            });
        Self {
            first_name: clean(self.first_name.as_deref()),
            last_name: clean(self.last_name.as_deref()),
            degree: clean(self.degree.as_deref()),
            email: clean(self.email.as_deref()),
            phone_number: clean(self.phone_number.as_deref()),
            npi: clean(self.npi.as_deref()),
            specialty: clean(self.specialty.as_deref()),
            location,
        }
    }

    pub fn display_name(&self) -> String {
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn address(street: &str) -> Address {
        Address {
            street: street.to_string(),
            city: "Brooklyn".to_string(),
            state: "ny".to_string(),
            zip_code: "11211-1234".to_string(),
        }
    }

    #[test]
    fn address_normalization_uppercases_state_and_trims_zip() {
        let a = address(" 123 Main St ").normalized();
        assert_eq!(a.street, "123 Main St");
        assert_eq!(a.state, "NY");
        assert_eq!(a.zip_code, "11211");
    }

    #[test]
    fn merge_keeps_names_and_refreshes_contacts() {
        let mut record = ProviderRecord::new("1609958305", "Ella", "Leers");
        record.email = Some("old@example.com".to_string());
        record.phone_number = Some("555-0100".to_string());

        let mut fragment = ProviderRecord::new("1609958305", "Elle", "Leers-Smith");
        fragment.email = Some("new@example.com".to_string());
        fragment.degree = Some("MD".to_string());

        assert!(record.merge(&fragment));
        assert_eq!(record.first_name, "Ella");
        assert_eq!(record.last_name, "Leers");
        assert_eq!(record.email.as_deref(), Some("new@example.com"));
        assert_eq!(record.phone_number.as_deref(), Some("555-0100"));
        assert_eq!(record.degree.as_deref(), Some("MD"));
    }

    #[test]
    fn merge_fills_missing_coordinates_on_known_address() {
        let mut record = ProviderRecord::new("1609958305", "Ella", "Leers");
        record.locations.push(Location::new(address("1 Bedford Ave"), None));

        let mut fragment = record.clone();
        fragment.locations = vec![Location::new(
            address("1 Bedford Ave "),
            Some(GeoPoint {
                lat: 40.72,
                lng: -73.96,
            }),
        )];

        assert!(record.merge(&fragment));
        assert_eq!(record.locations.len(), 1);
        assert!(record.location_is_geocoded(&address("1 Bedford Ave")));
        assert!(!record.merge(&fragment));
    }

    #[test]
    fn query_normalization_drops_blank_fields() {
        let q = ResolutionQuery {
            first_name: Some("  ".to_string()),
            last_name: Some(" Leers ".to_string()),
            location: Some(Address {
                street: " ".to_string(),
                city: String::new(),
                state: String::new(),
                zip_code: String::new(),
            }),
            ..ResolutionQuery::default()
        }
        .normalized();
        assert_eq!(q.first_name, None);
        assert_eq!(q.last_name.as_deref(), Some("Leers"));
        assert_eq!(q.location, None);
        assert_eq!(q.display_name(), "Leers");
    }

    fn fragment_strategy() -> impl Strategy<Value = ProviderRecord> {
        (
            prop::collection::btree_set("[A-Z]{2,5}", 0..4),
            prop::collection::btree_set(1i64..20, 0..4),
            prop::collection::vec("[0-9]{1,3} [A-Z][a-z]{2,6} St", 0..3),
        )
            .prop_map(|(specialties, insurances, streets)| {
                let mut r = ProviderRecord::new("1609958305", "Ella", "Leers");
                r.specialties = specialties;
                r.insurances = insurances;
                r.locations = streets
                    .iter()
                    .map(|s| Location::new(address(s), None))
                    .collect();
                r
            })
    }

    fn location_keys(r: &ProviderRecord) -> BTreeSet<Address> {
        r.locations.iter().map(|l| l.address.clone()).collect()
    }

    proptest! {
        #[test]
        fn merged_sets_are_the_union_of_fragments(
            a in fragment_strategy(),
            b in fragment_strategy(),
            c in fragment_strategy(),
        ) {
            let mut left = a.clone();
            left.merge(&b);
            left.merge(&c);

            let mut bc = b.clone();
            bc.merge(&c);
            let mut right = a.clone();
            right.merge(&bc);

            let union_specialties: BTreeSet<_> = a.specialties.iter()
                .chain(&b.specialties)
                .chain(&c.specialties)
                .cloned()
                .collect();
            let union_insurances: BTreeSet<_> = a.insurances.iter()
                .chain(&b.insurances)
                .chain(&c.insurances)
                .copied()
                .collect();
            let union_locations: BTreeSet<_> = location_keys(&a).into_iter()
                .chain(location_keys(&b))
                .chain(location_keys(&c))
                .collect();

            prop_assert_eq!(&left.specialties, &union_specialties);
            prop_assert_eq!(&left.insurances, &union_insurances);
            prop_assert_eq!(location_keys(&left), union_locations.clone());
            prop_assert_eq!(&right.specialties, &union_specialties);
            prop_assert_eq!(location_keys(&right), union_locations);

            let snapshot = left.clone();
            prop_assert!(!left.merge(&c));
            prop_assert_eq!(left, snapshot);
        }
    }
}
