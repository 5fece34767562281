//! Hand-coded layouts of the older kit firmware (ports 2, 3 and 4)
//!
//! ```text
//! port 2/4: [flags]? [PM1]? PM2.5 PM10 [counts]? meteo [gas aqi]? [gps]? [wind]? [accu]?
//! port 3:   version bitmap [lat lon alt]?   (or version 0 ... value event)
//! ```
//!
//! Flag byte bits (present when bit 7 of byte 0 is set):
//!
//! | bit  | block                                   |
//! |------|-----------------------------------------|
//! | 0x01 | PM1 mass                                |
//! | 0x02 | particle counts (9 bytes port 2, 12 port 4) |
//! | 0x04 | gas and aqi                             |
//! | 0x08 | GPS                                     |
//! | 0x10 | wind                                    |
//! | 0x20 | battery                                 |
//!
//! All words are big-endian. A zero word is "not measured" and is left out.

use crate::error::DecodeError;
use crate::geohash::{self, POSITION_PRECISION};
use crate::record::{Group, Measurement, SensorRecord};
use crate::rules::LegacyLayout;

const DUST_TYPES: [&str; 7] = [
    "unknown", "PPD42NS", "SDS011", "PMS7003", "SPS30", "unknown", "unknown",
];
const METEO_TYPES: [&str; 6] = ["unknown", "DHT11", "SHT85", "BME280", "BME680", "SHT31"];

/// Measurement names the hand-coded layouts can emit
pub const FIELD_NAMES: &[&str] = &[
    "pm1", "pm25", "pm10", "pm03_cnt", "pm05_cnt", "pm1_cnt", "pm25_cnt", "pm4_cnt",
    "pm5_cnt", "pm10_cnt", "grain", "temp", "rv", "luchtdruk", "gas", "aqi", "geohash",
    "alt", "ws", "wr", "accu", "version", "event", "value", "dust", "gps", "meteo",
];

const FLAG_PRESENT: u8 = 0x80;
const FLAG_PM1: u8 = 0x01;
const FLAG_COUNTS: u8 = 0x02;
const FLAG_GAS: u8 = 0x04;
const FLAG_GPS: u8 = 0x08;
const FLAG_WIND: u8 = 0x10;
const FLAG_ACCU: u8 = 0x20;

/// Decode one of the hand-coded layouts
pub fn decode(
    layout: LegacyLayout,
    product: &str,
    payload: &[u8],
) -> Result<SensorRecord, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty(product.to_string()));
    }
    let frame = Frame { product, payload };
    match layout {
        LegacyLayout::CompactCounts => frame.measurements(2),
        LegacyLayout::FullCounts => frame.measurements(4),
        LegacyLayout::Meta => frame.meta(),
    }
}

struct Frame<'a> {
    product: &'a str,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    fn slice(&self, sensor: &str, start: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        self.payload
            .get(start..start + len)
            .ok_or_else(|| DecodeError::Truncated {
                product: self.product.to_string(),
                sensor: sensor.to_string(),
                needed: len,
                available: self.payload.len().saturating_sub(start),
            })
    }

    fn measurements(&self, port: u8) -> Result<SensorRecord, DecodeError> {
        let bytes = self.payload;
        let mut record = SensorRecord::new();
        let mut start = 0;
        let mut flags = 0u8;

        if bytes[0] & FLAG_PRESENT != 0 {
            start = 1;
            flags = bytes[0];
        } else if port == 2 {
            // no flag byte: guess from the length
            if bytes.len() == 10 {
                let (name, meteo) = meteo(self.slice("meteo", 0, 6)?);
                record.groups.insert(name.to_string(), meteo);
                let (name, mut dust) = dust_mass(self.slice("dust", 6, 4)?);
                // this firmware sent PM10 before PM2.5
                let pm25 = dust.remove("pm25");
                let pm10 = dust.remove("pm10");
                if let Some(m) = pm10 {
                    dust.insert("pm25".to_string(), m);
                }
                if let Some(m) = pm25 {
                    dust.insert("pm10".to_string(), m);
                }
                record.groups.insert(name.to_string(), dust);
                return Ok(record);
            } else if bytes.len() >= 16 {
                flags |= FLAG_PM1 | FLAG_GAS;
            }
        }

        let mass_len = if flags & FLAG_PM1 != 0 { 6 } else { 4 };
        let (mass_name, mass) = dust_mass(self.slice("dust", start, mass_len)?);
        start += mass_len;

        if flags & FLAG_COUNTS != 0 {
            let (count_len, (name, mut counts)) = if port == 2 {
                (9, compact_counts(self.slice("counts", start, 9)?))
            } else {
                (12, full_counts(self.slice("counts", start, 12)?))
            };
            counts.extend(mass);
            record.groups.insert(name.to_string(), counts);
            start += count_len;
        } else {
            record.groups.insert(mass_name.to_string(), mass);
        }

        let meteo_len = if flags & FLAG_GAS != 0 { 10 } else { 6 };
        if bytes.len() < start + 6 {
            return Ok(record);
        }
        let (name, group) = meteo(self.slice("meteo", start, meteo_len)?);
        record.groups.insert(name.to_string(), group);
        start += meteo_len;

        if flags & FLAG_GPS != 0 && bytes.len() >= start + 12 {
            if let Some(gps) = gps(self.slice("NEO-6", start, 12)?) {
                record.groups.insert("NEO-6".to_string(), gps);
            }
            start += 12;
        }
        if flags & FLAG_WIND != 0 && bytes.len() >= start + 2 {
            record
                .groups
                .insert("wind".to_string(), wind(self.slice("wind", start, 2)?));
            start += 2;
        }
        if flags & FLAG_ACCU != 0 && bytes.len() > start {
            let volts = bytes[start];
            if volts > 0 {
                record.set("accu", "accu", Measurement::new(round(volts as f64 / 10.0, 2)));
            }
        }

        Ok(record)
    }

    fn meta(&self) -> Result<SensorRecord, DecodeError> {
        let head = self.slice("meta", 0, 2)?;
        let mut record = SensorRecord::new();
        record.set("meta", "version", Measurement::new(round(head[0] as f64 / 10.0, 1)));

        if head[1] == 0 {
            // event message: ... value event
            let len = self.payload.len();
            record.set("meta", "event", Measurement::new(self.payload[len - 1] as f64));
            if len > 2 && self.payload[len - 2] != 0 {
                record.set("meta", "value", Measurement::new(self.payload[len - 2] as f64));
            }
            return Ok(record);
        }

        let bitmap = head[1];
        let dust = DUST_TYPES
            .get((bitmap & 0x07) as usize)
            .copied()
            .unwrap_or(DUST_TYPES[0]);
        record.set("meta", "dust", Measurement::new(dust));
        if bitmap & 0x08 != 0 {
            record.set("meta", "gps", Measurement::new("NEO-6"));
        }
        let meteo = METEO_TYPES
            .get(((bitmap >> 4) & 0x0F) as usize)
            .copied()
            .unwrap_or(METEO_TYPES[0]);
        record.set("meta", "meteo", Measurement::new(meteo));

        if self.payload.len() >= 6 {
            let lat = long(self.payload, 2);
            if lat != 0 {
                let location = self.slice("geolocation", 2, 12)?;
                let lat = round(lat as f64 / 100_000.0, 6);
                let lon = round(long(location, 4) as f64 / 100_000.0, 6);
                if let Some(hash) = geohash::encode(lat, lon, POSITION_PRECISION) {
                    record.set("geolocation", "geohash", Measurement::new(hash));
                }
                record.set(
                    "geolocation",
                    "alt",
                    Measurement::new(round(long(location, 8) as f64 / 10.0, 1)),
                );
            }
        }
        Ok(record)
    }
}

fn word(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn long(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn scaled(bytes: &[u8], at: usize, div: f64) -> f64 {
    round(word(bytes, at) as f64 / div, 1)
}

/// PM mass in ug/m3: `[PM1] PM2.5 PM10`
fn dust_mass(bytes: &[u8]) -> (&'static str, Group) {
    let mut group = Group::new();
    let mut id = 0;
    let mut start = 0;
    if bytes.len() > 4 {
        if word(bytes, 0) != 0 {
            id = 3;
            group.insert("pm1".to_string(), Measurement::new(scaled(bytes, 0, 10.0)));
        }
        start = 2;
    }
    for (offset, name) in [(0, "pm25"), (2, "pm10")] {
        if word(bytes, start + offset) != 0 {
            if id == 0 {
                id = 2;
            }
            group.insert(
                name.to_string(),
                Measurement::new(scaled(bytes, start + offset, 10.0)),
            );
        }
    }
    (DUST_TYPES[id], group)
}

/// Port 2 particle counts: `HHH BBB`
fn compact_counts(bytes: &[u8]) -> (&'static str, Group) {
    let mut group = Group::new();
    for (at, name) in [(0, "pm03_cnt"), (2, "pm05_cnt"), (4, "pm1_cnt")] {
        if word(bytes, at) != 0 {
            group.insert(name.to_string(), Measurement::new(scaled(bytes, at, 10.0)));
        }
    }
    for (at, name) in [(6, "pm25_cnt"), (7, "pm5_cnt"), (8, "pm10_cnt")] {
        if bytes[at] != 0 {
            group.insert(
                name.to_string(),
                Measurement::new(round(bytes[at] as f64 / 10.0, 1)),
            );
        }
    }
    let id = if group.contains_key("pm10_cnt") || group.contains_key("pm5_cnt") {
        3
    } else {
        2
    };
    (DUST_TYPES[id], group)
}

/// Port 4 particle counts: `HHHHHH`
///
/// Bit 7 of byte 0 selects cumulative (PM0.3 up to PMx) counting with an
/// average grain size in the last word; bit 7 of byte 4 marks a Sensirion
/// sensor, whose fifth bin is PM4 instead of PM5.
fn full_counts(raw: &[u8]) -> (&'static str, Group) {
    let mut bytes = [0u8; 12];
    bytes.copy_from_slice(raw);
    let cumulative = bytes[0] & 0x80 != 0;
    bytes[0] &= 0x7F;
    let sensirion = bytes[4] & 0x80 != 0;
    bytes[4] &= 0x7F;
    let id = if sensirion { 4 } else { 3 };

    let mut pm10 = scaled(&bytes, 0, 10.0);
    let pm05 = scaled(&bytes, 2, 10.0);
    let mut pm1 = scaled(&bytes, 4, 10.0);
    let mut pm25 = scaled(&bytes, 6, 10.0);
    let mut pm4_or_5 = scaled(&bytes, 8, 10.0);

    let mut group = Group::new();
    if cumulative {
        group.insert(
            "grain".to_string(),
            Measurement::new(round(word(&bytes, 10) as f64 / 100.0, 2)),
        );
        pm1 = round(pm1 + pm05, 1);
        pm25 = round(pm1 + pm25, 1);
        pm4_or_5 = round(pm4_or_5 + pm25, 1);
        pm10 = round(pm4_or_5 + pm10, 1);
    } else {
        group.insert(
            "pm03_cnt".to_string(),
            Measurement::new(scaled(&bytes, 10, 10.0)),
        );
    }
    group.insert("pm10_cnt".to_string(), Measurement::new(pm10));
    group.insert("pm05_cnt".to_string(), Measurement::new(pm05));
    group.insert("pm1_cnt".to_string(), Measurement::new(pm1));
    group.insert("pm25_cnt".to_string(), Measurement::new(pm25));
    let bin = if sensirion { "pm4_cnt" } else { "pm5_cnt" };
    group.insert(bin.to_string(), Measurement::new(pm4_or_5));
    (DUST_TYPES[id], group)
}

/// Meteo: `temp rv [pressure [gas aqi]]`
fn meteo(bytes: &[u8]) -> (&'static str, Group) {
    let mut group = Group::new();
    let mut id = 0;
    if word(bytes, 0) != 0 {
        id = 1;
        group.insert(
            "temp".to_string(),
            Measurement::new(round(word(bytes, 0) as f64 / 10.0 - 30.0, 1)),
        );
    }
    if word(bytes, 2) != 0 {
        id = 5;
        group.insert("rv".to_string(), Measurement::new(scaled(bytes, 2, 10.0)));
    }
    if bytes.len() > 4 && word(bytes, 4) != 0 {
        id = 3;
        group.insert(
            "luchtdruk".to_string(),
            Measurement::new(word(bytes, 4) as f64),
        );
    }
    if bytes.len() > 6 {
        if word(bytes, 6) != 0 {
            id = 4;
            group.insert("gas".to_string(), Measurement::new(word(bytes, 6) as f64));
        }
        if word(bytes, 8) != 0 {
            group.insert("aqi".to_string(), Measurement::new(scaled(bytes, 8, 10.0)));
        }
    }
    (METEO_TYPES[id], group)
}

/// GPS: `lat lon alt` as unsigned longs
fn gps(bytes: &[u8]) -> Option<Group> {
    let lat = long(bytes, 0);
    let lon = long(bytes, 4);
    if lat == 0 || lon == 0 {
        return None;
    }
    let hash = geohash::encode(
        round(lat as f64 / 100_000.0, 5),
        round(lon as f64 / 100_000.0, 5),
        POSITION_PRECISION,
    )?;
    let mut group = Group::new();
    group.insert("geohash".to_string(), Measurement::new(hash));
    let alt = long(bytes, 8);
    if alt != 0 {
        group.insert("alt".to_string(), Measurement::new(round(alt as f64 / 10.0, 1)));
    }
    Some(group)
}

/// Wind: speed in 0.2 m/s steps (bit 7 of byte 1 adds 0.1), direction in 3 degree steps
fn wind(bytes: &[u8]) -> Group {
    let mut group = Group::new();
    let mut speed = round(bytes[0] as f64 / 5.0, 1);
    if bytes[1] & 0x80 != 0 {
        speed = round(speed + 0.1, 1);
    }
    group.insert("ws".to_string(), Measurement::new(speed));
    let direction = (bytes[1] & 0x7F) as u32;
    if direction > 0 {
        group.insert(
            "wr".to_string(),
            Measurement::new(((direction * 3) % 360) as f64),
        );
    }
    group
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port4_flagged_payload() {
        // flags: counts, gps; SDS mass; Plantower counts; meteo BME280; gps
        let mut payload = vec![FLAG_PRESENT | FLAG_COUNTS | FLAG_GPS];
        payload.extend_from_slice(&[0x00, 0x7B, 0x01, 0x41]); // pm25 12.3, pm10 32.1
        payload.extend_from_slice(&[
            0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E, 0x00, 0x28, 0x00, 0x32, 0x00, 0x3C,
        ]);
        payload.extend_from_slice(&[0x01, 0xF4, 0x02, 0x26, 0x03, 0xF5]); // 20.0 C, 55 %, 1013
        payload.extend_from_slice(&5_144_160u32.to_be_bytes()); // lat 51.4416
        payload.extend_from_slice(&546_970u32.to_be_bytes()); // lon 5.4697
        payload.extend_from_slice(&235u32.to_be_bytes());

        let record = decode(LegacyLayout::FullCounts, "MySenseV2", &payload).unwrap();
        let dust = record.group("PMS7003").unwrap();
        assert_eq!(dust.get("pm25").unwrap().number(), Some(12.3));
        assert_eq!(dust.get("pm10").unwrap().number(), Some(32.1));
        assert_eq!(dust.get("pm10_cnt").unwrap().number(), Some(1.0));
        assert_eq!(dust.get("pm03_cnt").unwrap().number(), Some(6.0));
        assert_eq!(dust.get("pm5_cnt").unwrap().number(), Some(5.0));

        assert_eq!(record.number("BME280", "temp"), Some(20.0));
        assert_eq!(record.number("BME280", "rv"), Some(55.0));
        assert_eq!(record.number("BME280", "luchtdruk"), Some(1013.0));

        let gps = record.group("NEO-6").unwrap();
        assert!(gps.get("geohash").unwrap().text().unwrap().starts_with("u15us"));
        assert_eq!(gps.get("alt").unwrap().number(), Some(23.5));
    }

    #[test]
    fn test_port4_truncated_counts() {
        let payload = [FLAG_PRESENT | FLAG_COUNTS, 0x00, 0x7B, 0x01, 0x41, 0x00];
        assert!(matches!(
            decode(LegacyLayout::FullCounts, "MySenseV2", &payload),
            Err(DecodeError::Truncated { needed: 12, available: 1, .. })
        ));
    }

    #[test]
    fn test_port2_unflagged_ten_bytes() {
        // meteo temp 21.0, rv 40.0, pressure 1000; then pm10 20.0, pm25 10.0 (swapped order)
        let payload = [
            0x01, 0xFE, 0x01, 0x90, 0x03, 0xE8, 0x00, 0xC8, 0x00, 0x64,
        ];
        let record = decode(LegacyLayout::CompactCounts, "MySenseV1", &payload).unwrap();
        assert_eq!(record.number("BME280", "temp"), Some(21.0));
        assert_eq!(record.number("SDS011", "pm25"), Some(10.0));
        assert_eq!(record.number("SDS011", "pm10"), Some(20.0));
    }

    #[test]
    fn test_port2_wind_and_battery() {
        let mut payload = vec![FLAG_PRESENT | FLAG_WIND | FLAG_ACCU];
        payload.extend_from_slice(&[0x00, 0x64, 0x00, 0xC8]); // pm25 10, pm10 20
        payload.extend_from_slice(&[0x01, 0x2C, 0x00, 0x00, 0x00, 0x00]); // 0.0 C
        payload.extend_from_slice(&[0x19, 0x80 | 30]); // 5.1 m/s, 90 degrees
        payload.push(37); // 3.7 V

        let record = decode(LegacyLayout::CompactCounts, "MySenseV1", &payload).unwrap();
        assert_eq!(record.number("DHT11", "temp"), Some(0.0));
        assert_eq!(record.number("wind", "ws"), Some(5.1));
        assert_eq!(record.number("wind", "wr"), Some(90.0));
        assert_eq!(record.number("accu", "accu"), Some(3.7));
    }

    #[test]
    fn test_port3_meta() {
        let mut payload = vec![12, 0x03 | 0x08 | (3 << 4)];
        payload.extend_from_slice(&5_144_160u32.to_be_bytes());
        payload.extend_from_slice(&546_970u32.to_be_bytes());
        payload.extend_from_slice(&120u32.to_be_bytes());
        let record = decode(LegacyLayout::Meta, "MySenseMeta", &payload).unwrap();
        let meta = record.group("meta").unwrap();
        assert_eq!(meta.get("version").unwrap().number(), Some(1.2));
        assert_eq!(meta.get("dust").unwrap().text(), Some("PMS7003"));
        assert_eq!(meta.get("gps").unwrap().text(), Some("NEO-6"));
        assert_eq!(meta.get("meteo").unwrap().text(), Some("BME280"));
        assert_eq!(record.number("geolocation", "alt"), Some(12.0));
    }

    #[test]
    fn test_port3_event() {
        let record = decode(LegacyLayout::Meta, "MySenseMeta", &[10, 0, 7, 3]).unwrap();
        assert_eq!(record.number("meta", "event"), Some(3.0));
        assert_eq!(record.number("meta", "value"), Some(7.0));
    }

    #[test]
    fn test_port3_dust_id_out_of_table() {
        let record = decode(LegacyLayout::Meta, "MySenseMeta", &[10, 0x07]).unwrap();
        let meta = record.group("meta").unwrap();
        assert_eq!(meta.get("dust").unwrap().text(), Some("unknown"));
    }

    #[test]
    fn test_port3_every_bitmap_decodes() {
        for bitmap in 0..=255u8 {
            assert!(decode(LegacyLayout::Meta, "MySenseMeta", &[10, bitmap]).is_ok());
            let mut located = vec![10, bitmap];
            located.extend_from_slice(&5_144_160u32.to_be_bytes());
            located.extend_from_slice(&546_970u32.to_be_bytes());
            located.extend_from_slice(&120u32.to_be_bytes());
            assert!(decode(LegacyLayout::Meta, "MySenseMeta", &located).is_ok());
        }
    }

    #[test]
    fn test_port3_truncated_location() {
        let payload = [10, 0x13, 0x00, 0x4E, 0x7E, 0x60, 0x00];
        assert!(matches!(
            decode(LegacyLayout::Meta, "MySenseMeta", &payload),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
