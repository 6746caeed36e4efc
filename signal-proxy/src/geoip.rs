use maxminddb::geoip2;
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

use crate::models::GeoInfo;

/// Read-only GeoIP resolver over a local MMDB file, opened once at startup
/// and shared. Lookups never fail; anything unresolvable returns `None`.
pub struct GeoIpResolver {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoIpResolver {
    /// Returns `None` (enrichment disabled) when the path is unset, missing,
    /// or not a readable MMDB. The proxy stays functional either way.
    pub fn open(path: Option<&str>) -> Option<Self> {
        let path = path?;
        if !Path::new(path).exists() {
            warn!(path, "GeoIP database not found; enrichment disabled");
            return None;
        }
        match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => {
                info!(path, "GeoIP database loaded");
                Some(Self { reader })
            }
            Err(err) => {
                warn!(path, error = %err, "Failed to open GeoIP database; enrichment disabled");
                None
            }
        }
    }

    pub fn lookup(&self, ip: &str) -> Option<GeoInfo> {
        let addr: IpAddr = ip.parse().ok()?;
        let city: geoip2::City = self.reader.lookup(addr).ok()?;

        let country = city.country.as_ref();
        let info = GeoInfo {
            country_code: country
                .and_then(|c| c.iso_code)
                .map(|code| code.to_string()),
            country_name: country
                .and_then(|c| c.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| name.to_string()),
            city: city
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| name.to_string()),
            region: city
                .subdivisions
                .as_ref()
                .and_then(|subs| subs.first())
                .and_then(|sub| sub.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| name.to_string()),
            latitude: city.location.as_ref().and_then(|l| l.latitude),
            longitude: city.location.as_ref().and_then(|l| l.longitude),
            timezone: city
                .location
                .as_ref()
                .and_then(|l| l.time_zone)
                .map(|tz| tz.to_string()),
        };

        // An empty record is as good as no record.
        if info.country_code.is_none() && info.latitude.is_none() {
            return None;
        }
        Some(info)
    }
}
