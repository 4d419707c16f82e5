use super::zone::{Zone, TTL};
use crate::backends::{BackendRegistry, BuiltinNames};
use crate::error::Error;
use crate::server::ServerOption;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::error;
use trust_dns_proto::op::Edns;
use trust_dns_server::authority::MessageResponseBuilder;
use trust_dns_server::client::op::{Header, MessageType, OpCode, ResponseCode};
use trust_dns_server::client::rr::rdata::TXT;
use trust_dns_server::client::rr::{DNSClass, LowerName, Name, RData, Record, RecordType};
use trust_dns_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

/// Payload size advertised when no override is configured.
pub(super) const DEFAULT_MAX_UDP: u16 = 1232;

#[derive(Debug, Default)]
pub(super) struct Stats {
    pub(super) queries: AtomicU64,
    pub(super) answered: AtomicU64,
    pub(super) nxdomain: AtomicU64,
    pub(super) refused: AtomicU64,
    pub(super) dropped: AtomicU64,
    pub(super) failed: AtomicU64,
}

impl Stats {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn log(&self) {
        tracing::info!(
            queries = self.queries.load(Ordering::Relaxed),
            answered = self.answered.load(Ordering::Relaxed),
            nxdomain = self.nxdomain.load(Ordering::Relaxed),
            refused = self.refused.load(Ordering::Relaxed),
            dropped = self.dropped.load(Ordering::Relaxed),
            failed = self.failed.load(Ordering::Relaxed),
            "query statistics"
        );
    }
}

/// State shared between the name server context and its request handlers.
pub(super) struct Shared {
    pub(super) zone: RwLock<Arc<Zone>>,
    options: AtomicU32,
    delay_ms: AtomicU64,
    max_udp: u16,
    pub(super) builtin: Arc<BuiltinNames>,
    pub(super) backends: Arc<BackendRegistry>,
    pub(super) stats: Stats,
}

impl Shared {
    pub(super) fn new(
        zone: Zone,
        max_udp: Option<u16>,
        builtin: Arc<BuiltinNames>,
        backends: Arc<BackendRegistry>,
    ) -> Self {
        Self {
            zone: RwLock::new(Arc::new(zone)),
            options: AtomicU32::new(0),
            delay_ms: AtomicU64::new(0),
            max_udp: max_udp.unwrap_or(DEFAULT_MAX_UDP).max(512),
            builtin,
            backends,
            stats: Stats::default(),
        }
    }

    pub(super) fn set_option(&self, option: ServerOption, value: bool) {
        if value {
            self.options.fetch_or(option.bit(), Ordering::SeqCst);
        } else {
            self.options.fetch_and(!option.bit(), Ordering::SeqCst);
        }
    }

    pub(super) fn option(&self, option: ServerOption) -> bool {
        self.options.load(Ordering::SeqCst) & option.bit() != 0
    }

    pub(super) fn set_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::SeqCst))
    }
}

#[derive(Clone)]
pub struct Handler {
    shared: Arc<Shared>,
}

impl Handler {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Handler { shared }
    }

    async fn dispatch_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
    ) -> Result<ResponseInfo, Error> {
        let shared = &self.shared;
        Stats::bump(&shared.stats.queries);

        let delay = shared.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if shared.option(ServerOption::DropEdns) && request.edns().is_some() {
            Stats::bump(&shared.stats.dropped);
            return Ok(Header::response_from_request(request.header()).into());
        }

        // If it isn't a query, return NOTIMPL.
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return self.send_error(request, response, ResponseCode::NotImp).await;
        }

        match request.query().query_class() {
            DNSClass::IN => {}
            DNSClass::CH => return self.handle_chaos(request, response).await,
            _ => return self.send_error(request, response, ResponseCode::Refused).await,
        }

        let zone = Arc::clone(&*shared.zone.read().await);
        let name = request.query().name();
        match request.query().query_type() {
            RecordType::A | RecordType::AAAA => {
                self.handle_address(request, response, &zone).await
            }
            RecordType::SOA if *name == zone.domain => {
                self.send_answer(request, response, vec![zone.soa_record()])
                    .await
            }
            RecordType::NS if *name == zone.domain => {
                self.send_answer(request, response, vec![zone.ns_record()])
                    .await
            }
            _ => self.send_negative(request, response, &zone).await,
        }
    }

    async fn handle_chaos<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
    ) -> Result<ResponseInfo, Error> {
        let query = request.query();
        if query.query_type() != RecordType::TXT {
            return self.send_error(request, response, ResponseCode::Refused).await;
        }
        match self.shared.builtin.lookup(query.name()) {
            Some(values) => {
                let mut record = Record::from_rdata(
                    Name::from(query.name()),
                    0,
                    RData::TXT(TXT::new(values.to_vec())),
                );
                record.set_dns_class(DNSClass::CH);
                self.send_answer(request, response, vec![record]).await
            }
            None => {
                Stats::bump(&self.shared.stats.nxdomain);
                self.respond(request, response, ResponseCode::NXDomain, &[], &[], true)
                    .await
            }
        }
    }

    async fn handle_address<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
        zone: &Zone,
    ) -> Result<ResponseInfo, Error> {
        let name = request.query().name();
        let addrs = match zone.addrs(name) {
            Some(addrs) => Some(addrs.to_vec()),
            None => self.shared.backends.lookup(name),
        };
        let Some(addrs) = addrs else {
            return self.send_negative(request, response, zone).await;
        };

        let want_v4 = request.query().query_type() == RecordType::A;
        let mut rdata: Vec<RData> = addrs
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) if want_v4 => Some(RData::A(*v4)),
                IpAddr::V6(v6) if !want_v4 => Some(RData::AAAA(*v6)),
                _ => None,
            })
            .collect();
        if rdata.is_empty() {
            return self.send_nodata(request, response, zone, name).await;
        }
        if !self.shared.option(ServerOption::FixedLocal) {
            let queries = self.shared.stats.queries.load(Ordering::Relaxed);
            let offset = usize::try_from(queries % rdata.len() as u64).unwrap_or(0);
            rdata.rotate_left(offset);
        }
        let records = rdata
            .into_iter()
            .map(|rd| Record::from_rdata(Name::from(name), TTL, rd))
            .collect();
        self.send_answer(request, response, records).await
    }

    /// Answer for a name or type the zone has no data for: NXDOMAIN, NODATA for names that
    /// exist, or REFUSED outside the zone.
    async fn send_negative<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
        zone: &Zone,
    ) -> Result<ResponseInfo, Error> {
        let name = request.query().name();
        if !zone.contains(name) {
            return self.send_error(request, response, ResponseCode::Refused).await;
        }
        let nearest = !self.shared.option(ServerOption::NoNearest) && zone.has_descendants(name);
        if zone.has_name(name) || nearest {
            return self.send_nodata(request, response, zone, name).await;
        }
        Stats::bump(&self.shared.stats.nxdomain);
        let soa = self.negative_soa(zone, name);
        self.respond(request, response, ResponseCode::NXDomain, &[], &soa, true)
            .await
    }

    async fn send_nodata<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
        zone: &Zone,
        name: &LowerName,
    ) -> Result<ResponseInfo, Error> {
        Stats::bump(&self.shared.stats.answered);
        let soa = self.negative_soa(zone, name);
        self.respond(request, response, ResponseCode::NoError, &[], &soa, zone.contains(name))
            .await
    }

    fn negative_soa(&self, zone: &Zone, name: &LowerName) -> Vec<Record> {
        if self.shared.option(ServerOption::NoSoa) || !zone.contains(name) {
            Vec::new()
        } else {
            vec![zone.soa_record()]
        }
    }

    async fn send_answer<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
        records: Vec<Record>,
    ) -> Result<ResponseInfo, Error> {
        Stats::bump(&self.shared.stats.answered);
        self.respond(request, response, ResponseCode::NoError, &records, &[], true)
            .await
    }

    async fn send_error<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        code: ResponseCode,
    ) -> Result<ResponseInfo, Error> {
        if code == ResponseCode::Refused {
            Stats::bump(&self.shared.stats.refused);
        }
        let response = MessageResponseBuilder::from_message_request(request);
        Ok(response_handle
            .send_response(response.error_msg(request.header(), code))
            .await?)
    }

    async fn respond<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        code: ResponseCode,
        answers: &[Record],
        soa: &[Record],
        authoritative: bool,
    ) -> Result<ResponseInfo, Error> {
        let shared = &self.shared;
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(authoritative && !shared.option(ServerOption::NoAa));
        header.set_recursion_available(shared.option(ServerOption::ClientTest));
        header.set_response_code(code);

        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = self.response_edns(request) {
            builder.edns(edns);
        }
        let response = builder.build(header, answers.iter(), &[], soa.iter(), &[]);
        Ok(response_handle.send_response(response).await?)
    }

    fn response_edns(&self, request: &Request) -> Option<Edns> {
        if self.shared.option(ServerOption::NoEdns) {
            return None;
        }
        request.edns()?;
        let mut edns = Edns::new();
        edns.set_max_payload(self.shared.max_udp);
        edns.set_version(0);
        Some(edns)
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self.dispatch_request(request, response_handle).await {
            Ok(info) => info,
            Err(error) => {
                Stats::bump(&self.shared.stats.failed);
                error!("error in RequestHandler: {:?}", error);
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}
