use std::collections::HashMap;

use hickory_resolver::TokioAsyncResolver;
use parking_lot::RwLock;

use crate::*;

const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum DnsError {
	#[error("empty domain")]
	EmptyDomain,
	#[error("no addresses for {0}")]
	NoAddresses(Strng),
	#[error("lookup failed for {domain}: {cause}")]
	Lookup { domain: Strng, cause: anyhow::Error },
}

/// A resolved destination plus the IP pinned for the requesting action.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDest {
	pub domain: Strng,
	pub ips: Vec<IpAddr>,
	pub pinned_ip: IpAddr,
	pub cached_at: Instant,
	pub ttl: Duration,
}

impl ResolvedDest {
	fn expired(&self) -> bool {
		self.cached_at.elapsed() >= self.ttl
	}
}

enum Lookup {
	System(TokioAsyncResolver),
	#[cfg(test)]
	Mock(Arc<tests::MockLookup>),
}

impl Lookup {
	async fn lookup(&self, domain: &str) -> anyhow::Result<Vec<IpAddr>> {
		match self {
			Lookup::System(resolver) => {
				let found = resolver.lookup_ip(domain).await?;
				Ok(found.iter().collect())
			},
			#[cfg(test)]
			Lookup::Mock(mock) => mock.lookup(domain),
		}
	}
}

#[derive(Default)]
struct Tables {
	/// domain -> cached resolution.
	cache: HashMap<Strng, ResolvedDest>,
	/// request id -> domain -> pinned resolution. Pins override the cache so
	/// one action always dials the address it was evaluated against,
	/// regardless of concurrent cache rotation (the anti-rebinding property).
	pins: HashMap<Strng, HashMap<Strng, ResolvedDest>>,
}

/// DNS resolver with a TTL cache and per-request pinning.
pub struct PinnedResolver {
	lookup: Lookup,
	ttl: Duration,
	tables: RwLock<Tables>,
}

impl PinnedResolver {
	pub fn system() -> anyhow::Result<Self> {
		let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
		Ok(Self::with_lookup(Lookup::System(resolver), DEFAULT_TTL))
	}

	pub fn system_with_ttl(ttl: Duration) -> anyhow::Result<Self> {
		let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
		Ok(Self::with_lookup(Lookup::System(resolver), ttl))
	}

	fn with_lookup(lookup: Lookup, ttl: Duration) -> Self {
		PinnedResolver {
			lookup,
			ttl,
			tables: RwLock::new(Tables::default()),
		}
	}

	/// Resolve `domain` for `request_id`. Repeated calls with the same pair
	/// return the same pinned IP until `release_request`.
	pub async fn resolve(&self, request_id: &Strng, domain: &Strng) -> Result<ResolvedDest, DnsError> {
		if domain.is_empty() {
			return Err(DnsError::EmptyDomain);
		}

		{
			let tables = self.tables.read();
			if let Some(pinned) = tables.pins.get(request_id).and_then(|p| p.get(domain)) {
				return Ok(pinned.clone());
			}
			if let Some(entry) = tables.cache.get(domain)
				&& !entry.expired()
			{
				let entry = entry.clone();
				drop(tables);
				return Ok(self.pin(request_id, domain, entry));
			}
		}

		let ips = self
			.lookup
			.lookup(domain.as_str())
			.await
			.map_err(|cause| DnsError::Lookup {
				domain: domain.clone(),
				cause,
			})?;
		if ips.is_empty() {
			return Err(DnsError::NoAddresses(domain.clone()));
		}

		let entry = ResolvedDest {
			domain: domain.clone(),
			pinned_ip: ips[0],
			ips,
			cached_at: Instant::now(),
			ttl: self.ttl,
		};
		let mut tables = self.tables.write();
		tables.cache.insert(domain.clone(), entry.clone());
		let pins = tables.pins.entry(request_id.clone()).or_default();
		Ok(pins.entry(domain.clone()).or_insert(entry).clone())
	}

	fn pin(&self, request_id: &Strng, domain: &Strng, entry: ResolvedDest) -> ResolvedDest {
		let mut tables = self.tables.write();
		let pins = tables.pins.entry(request_id.clone()).or_default();
		// A concurrent resolve for the same pair may have pinned first; the
		// earlier pin wins so the request keeps observing one address.
		pins.entry(domain.clone()).or_insert(entry).clone()
	}

	/// Drop every pin held for a request. Called once the chain completes.
	pub fn release_request(&self, request_id: &Strng) {
		self.tables.write().pins.remove(request_id);
	}

	/// Sweep expired entries out of the shared cache. Pins are untouched.
	pub fn clean_expired(&self) {
		self.tables.write().cache.retain(|_, e| !e.expired());
	}

	#[cfg(test)]
	pub(crate) fn mocked(
		answers: &[(&str, &[&str])],
		ttl: Duration,
	) -> (Self, Arc<tests::MockLookup>) {
		let mock = tests::MockLookup::new(answers);
		(Self::with_lookup(Lookup::Mock(mock.clone()), ttl), mock)
	}

	#[cfg(test)]
	pub(crate) fn cache_len(&self) -> usize {
		self.tables.read().cache.len()
	}

	#[cfg(test)]
	pub(crate) fn pin_count(&self) -> usize {
		self.tables.read().pins.len()
	}
}

#[cfg(test)]
#[path = "dns_tests.rs"]
pub(crate) mod tests;
