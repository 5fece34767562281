//! Geohash position tokens
//!
//! Latitude/longitude pairs travel as one base32 geohash string. Precision
//! 11 resolves to roughly 3 meters.

/// Precision used for kit and gateway positions
pub const POSITION_PRECISION: usize = 11;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Encode a position; `None` when the coordinates are not on the globe
pub fn encode(lat: f64, lon: f64, precision: usize) -> Option<String> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) || precision == 0 {
        return None;
    }
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0u8;
    let mut index = 0usize;

    while hash.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if lon >= mid {
                index = index * 2 + 1;
                lon_lo = mid;
            } else {
                index *= 2;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                index = index * 2 + 1;
                lat_lo = mid;
            } else {
                index *= 2;
                lat_hi = mid;
            }
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            hash.push(BASE32[index] as char);
            bits = 0;
            index = 0;
        }
    }
    Some(hash)
}

/// Bounding box `(lat_lo, lat_hi, lon_lo, lon_hi)` of a geohash cell
pub fn bounds(hash: &str) -> Option<(f64, f64, f64, f64)> {
    if hash.is_empty() {
        return None;
    }
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for c in hash.bytes() {
        let index = BASE32.iter().position(|b| *b == c.to_ascii_lowercase())?;
        for shift in (0..5).rev() {
            let bit = (index >> shift) & 1 == 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }
    Some((lat_lo, lat_hi, lon_lo, lon_hi))
}

/// Centre `(lat, lon)` of a geohash cell
pub fn decode(hash: &str) -> Option<(f64, f64)> {
    let (lat_lo, lat_hi, lon_lo, lon_hi) = bounds(hash)?;
    Some(((lat_lo + lat_hi) / 2.0, (lon_lo + lon_hi) / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_known_hash() {
        assert_eq!(
            encode(57.64911, 10.40744, 11).as_deref(),
            Some("u4pruydqqvj")
        );
        assert_eq!(encode(57.64911, 10.40744, 5).as_deref(), Some("u4pru"));
    }

    #[test]
    fn test_decode_centre() {
        let (lat, lon) = decode("u4pruydqqvj").unwrap();
        assert_abs_diff_eq!(lat, 57.64911, epsilon = 1e-4);
        assert_abs_diff_eq!(lon, 10.40744, epsilon = 1e-4);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(encode(91.0, 0.0, 11).is_none());
        assert!(encode(0.0, f64::NAN, 11).is_none());
        assert!(decode("").is_none());
        assert!(decode("u4a").is_none()); // 'a' is not in the alphabet
    }

    #[test]
    fn test_round_trip_stays_in_cell() {
        let hash = encode(51.4416, 5.4697, POSITION_PRECISION).unwrap();
        let (lat, lon) = decode(&hash).unwrap();
        assert_eq!(encode(lat, lon, POSITION_PRECISION).unwrap(), hash);
    }
}
