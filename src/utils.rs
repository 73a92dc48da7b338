use chrono::{DateTime, Utc};
use rand::Rng;

const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Adds a scheme to an ICE url if it has none.
/// Entries that carry credentials are relays, everything else is treated as STUN.
pub fn add_ice_url_scheme(url: &str, has_credentials: bool) -> String {
    let url = url.trim();
    if ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        url.to_string()
    } else {
        let scheme = if has_credentials { "turn:" } else { "stun:" };
        format!("{}{}", scheme, url)
    }
}

pub fn unix_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Wall-clock timestamp for pong replies: unix seconds with a millisecond fraction.
pub fn pong_timestamp(at: DateTime<Utc>) -> String {
    let millis = at.timestamp_millis();
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}
