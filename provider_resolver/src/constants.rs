pub const DEFAULT_NPI_API_BASE_URL: &str = "https://npiregistry.cms.hhs.gov/api/";
pub const DEFAULT_NPI_API_VERSION: &str = "2.1";
pub const DEFAULT_GEOCODE_API_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

pub const NPPES_API_DOC_URL: &str = "https://npiregistry.cms.hhs.gov/api-page";

/// Radius used for follow-up suggestions when the caller does not override it.
pub const SUGGESTION_MAX_DISTANCE_M: f64 = 10_000.0;

pub const UNKNOWN_SPECIALTY: &str = "unknown";

pub const USER_AGENT: &str = "provider-resolver/0.1";
