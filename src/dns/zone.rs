use crate::config::ServerSettings;
use crate::error::Error;
use ahash::RandomState;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::net::IpAddr;
use time::macros::format_description;
use time::OffsetDateTime;
use trust_dns_proto::rr::rdata::SOA;
use trust_dns_server::client::rr::{LowerName, Name, RData, Record};

lazy_static! {
    static ref SERIAL_FORMATTER: &'static [time::format_description::FormatItem<'static>] =
        format_description!(version = 2, "[year][month][day]");
}

/// TTL of every record served from the zone.
pub(super) const TTL: u32 = 300;

/// The data the name server is authoritative for. Replaced wholesale on reload.
#[derive(Debug)]
pub(super) struct Zone {
    pub(super) domain: LowerName,
    ns_domain: LowerName,
    ns_admin: Name,
    addrs: HashMap<LowerName, Vec<IpAddr>, RandomState>,
}

impl Zone {
    pub(super) fn from_settings(settings: &ServerSettings, hasher: RandomState) -> Result<Self, Error> {
        let mut addrs = HashMap::with_capacity_and_hasher(settings.addrs.len(), hasher);
        for (name, ips) in &settings.addrs {
            if !settings.domain.zone_of(name) {
                return Err(Error::InvalidConfig(format!(
                    "address for {name} is outside of {}",
                    settings.domain
                )));
            }
            addrs.insert(name.clone(), ips.clone());
        }
        Ok(Self {
            domain: settings.domain.clone(),
            ns_domain: settings.ns_domain.clone(),
            ns_admin: settings.ns_admin()?,
            addrs,
        })
    }

    pub(super) fn addrs(&self, name: &LowerName) -> Option<&[IpAddr]> {
        self.addrs.get(name).map(Vec::as_slice)
    }

    pub(super) fn contains(&self, name: &LowerName) -> bool {
        self.domain.zone_of(name)
    }

    /// Whether `name` exists in the zone: it has data or is the apex.
    pub(super) fn has_name(&self, name: &LowerName) -> bool {
        *name == self.domain || self.addrs.contains_key(name)
    }

    /// Whether `name` is an empty non-terminal: it has no data of its own but names below it do.
    pub(super) fn has_descendants(&self, name: &LowerName) -> bool {
        self.addrs.keys().any(|n| n != name && name.zone_of(n))
    }

    pub(super) fn soa_record(&self) -> Record {
        let serial: u32 = OffsetDateTime::now_utc()
            .format(&SERIAL_FORMATTER)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);
        // See RIPE 203[0] for recommended values.
        // [0]: https://www.ripe.net/publications/docs/ripe-203
        let soa = RData::SOA(SOA::new(
            Name::from(&self.ns_domain),
            self.ns_admin.clone(),
            serial,
            86_400,    // 24 hrs.
            7_200,     // 2 hours.
            3_600_000, // 1000 hours.
            TTL,
        ));
        Record::from_rdata(Name::from(&self.domain), TTL, soa)
    }

    pub(super) fn ns_record(&self) -> Record {
        Record::from_rdata(
            Name::from(&self.domain),
            TTL,
            RData::NS(Name::from(&self.ns_domain)),
        )
    }

    pub(super) fn len(&self) -> usize {
        self.addrs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn lower(name: &str) -> LowerName {
        LowerName::from(Name::from_str(name).unwrap())
    }

    fn settings() -> ServerSettings {
        let mut s = ServerSettings {
            domain: lower("example.com."),
            ns_domain: lower("ns1.example.com."),
            ..ServerSettings::default()
        };
        s.addrs.insert(
            lower("www.a.example.com."),
            vec!["192.0.2.1".parse().unwrap()],
        );
        s
    }

    #[test]
    fn names_and_non_terminals() {
        let zone = Zone::from_settings(&settings(), RandomState::new()).unwrap();
        assert!(zone.contains(&lower("nope.example.com.")));
        assert!(!zone.contains(&lower("example.net.")));
        assert!(zone.has_name(&lower("example.com.")));
        assert!(zone.has_name(&lower("WWW.A.example.com.")));
        assert!(!zone.has_name(&lower("a.example.com.")));
        assert!(zone.has_descendants(&lower("a.example.com.")));
        assert!(!zone.has_descendants(&lower("www.a.example.com.")));
        assert_eq!(zone.len(), 1);
    }

    #[test]
    fn soa_serial_is_a_date() {
        let zone = Zone::from_settings(&settings(), RandomState::new()).unwrap();
        let record = zone.soa_record();
        let Some(RData::SOA(soa)) = record.data() else {
            panic!("not a SOA record");
        };
        assert!(soa.serial() > 20_000_000);
        assert_eq!(soa.minimum(), TTL);
    }

    #[test]
    fn rejects_names_outside_domain() {
        let mut s = settings();
        s.addrs
            .insert(lower("www.example.net."), vec!["192.0.2.9".parse().unwrap()]);
        assert!(matches!(
            Zone::from_settings(&s, RandomState::new()),
            Err(Error::InvalidConfig(_))
        ));
    }
}
