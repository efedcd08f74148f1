use std::time::Duration;

use failure::Fail;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::Resolver;

use crate::config::ResolverSetup;
use crate::error::Error;

/// A mail exchanger for a domain
#[derive(Debug, Clone, PartialEq)]
pub struct Exchanger {
    pub preference: u16,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Fail)]
pub enum ResolveError {
    #[fail(display = "MX lookup for {} failed: {}", domain, reason)]
    Lookup { domain: String, reason: String },

    #[fail(display = "no mail exchangers for {}", _0)]
    NoExchangers(String),
}

/// Resolves the mail exchangers responsible for a domain
pub trait ExchangerResolver: Send + Sync {
    /// Exchangers in order of preference, lowest preference value first.
    /// Never returns an empty list.
    fn resolve(&self, domain: &str) -> Result<Vec<Exchanger>, ResolveError>;
}

/// DNS backed resolver.  Lookups are not cached across messages.
pub struct DnsResolver {
    resolver: Resolver,
}

impl DnsResolver {
    pub fn new(setup: &ResolverSetup, timeout: Duration) -> Result<DnsResolver, Error> {
        let (config, mut opts) = match *setup {
            ResolverSetup::SystemConf => trust_dns_resolver::system_conf::read_system_conf()
                .map_err(Error::ResolverCreation)?,
            ResolverSetup::Google => (ResolverConfig::google(), ResolverOpts::default()),
            ResolverSetup::Cloudflare => (ResolverConfig::cloudflare(), ResolverOpts::default()),
            ResolverSetup::Quad9 => (ResolverConfig::quad9(), ResolverOpts::default()),
            ResolverSetup::Custom(ref config) => (config.clone(), ResolverOpts::default()),
        };
        opts.timeout = timeout;

        let resolver = Resolver::new(config, opts).map_err(Error::ResolverCreation)?;
        Ok(DnsResolver { resolver })
    }
}

impl ExchangerResolver for DnsResolver {
    fn resolve(&self, domain: &str) -> Result<Vec<Exchanger>, ResolveError> {
        // Fully qualify so the search list is never consulted
        let query = format!("{}.", domain.trim_end_matches('.'));

        let response = match self.resolver.mx_lookup(&*query) {
            Ok(res) => res,
            Err(e) => {
                return match *e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => {
                        Err(ResolveError::NoExchangers(domain.to_owned()))
                    }
                    _ => Err(ResolveError::Lookup {
                        domain: domain.to_owned(),
                        reason: format!("{}", e),
                    }),
                };
            }
        };

        let records: Vec<(u16, String)> = response
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().to_string()))
            .collect();

        let exchangers = rank(records);
        debug!("got mx servers for {}: {:?}", domain, exchangers);

        if exchangers.is_empty() {
            return Err(ResolveError::NoExchangers(domain.to_owned()));
        }
        Ok(exchangers)
    }
}

/// Order MX records by preference (stable for equal preferences) and strip the
/// trailing root label.  A null MX (RFC 7505, exchange ".") means the domain
/// accepts no mail, so it yields no exchangers.
pub fn rank(mut records: Vec<(u16, String)>) -> Vec<Exchanger> {
    records.sort_by_key(|r| r.0);

    records
        .into_iter()
        .map(|(preference, exch)| Exchanger {
            preference,
            host: exch.trim_end_matches(|c| c == '.').to_owned(),
        })
        .filter(|e| !e.host.is_empty())
        .collect()
}
