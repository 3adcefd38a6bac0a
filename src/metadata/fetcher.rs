use std::{collections::HashMap, io::Read};

use reqwest::blocking::Client;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::Url;

use super::{parse_metadata, EidasMetadataParameters, MetadataCache, MetadataSigner};
use crate::{
    config::MetadataConfig,
    error::{EngineError, EngineResult, ErrorKey},
};

pub trait MetadataClock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl MetadataClock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Source of peer metadata. Implementations verify the document before
/// returning anything parsed from it.
pub trait MetadataFetcher: Send + Sync {
    fn get_eidas_metadata(
        &self,
        url: &str,
        signer: &dyn MetadataSigner,
        clock: &dyn MetadataClock,
    ) -> EngineResult<EidasMetadataParameters>;
}

fn is_expired(parameters: &EidasMetadataParameters, clock: &dyn MetadataClock) -> bool {
    parameters
        .valid_until
        .is_some_and(|valid_until| valid_until <= clock.now())
}

/// Signature first, then content.
fn process_metadata(
    url: &str,
    xml: &str,
    check_signature: bool,
    signer: &dyn MetadataSigner,
    clock: &dyn MetadataClock,
) -> EngineResult<EidasMetadataParameters> {
    if check_signature {
        signer.validate_metadata_signature(xml).map_err(|e| {
            warn!(url, error = %e, "metadata signature rejected");
            e
        })?;
    }
    let parameters = parse_metadata(xml.as_bytes())?;
    if parameters.entity_id != url {
        return Err(EngineError::metadata(
            ErrorKey::SamlEngineInvalidMetadata,
            format!("metadata at {url} describes {}", parameters.entity_id),
        ));
    }
    if is_expired(&parameters, clock) {
        return Err(EngineError::metadata(
            ErrorKey::SamlEngineInvalidMetadata,
            format!("metadata at {url} is no longer valid"),
        ));
    }
    Ok(parameters)
}

/// Reads at most `limit` bytes of UTF-8 from `body`.
fn read_bounded(url: &str, body: impl Read, limit: u64) -> EngineResult<String> {
    let mut bytes = Vec::new();
    body.take(limit.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| EngineError::metadata(ErrorKey::SamlEngineNoMetadata, format!("cannot read {url}: {e}")))?;
    if bytes.len() as u64 > limit {
        return Err(EngineError::metadata(
            ErrorKey::SamlEngineInvalidMetadata,
            format!("metadata at {url} exceeds {limit} bytes"),
        ));
    }
    String::from_utf8(bytes).map_err(|_| {
        EngineError::metadata(ErrorKey::SamlEngineInvalidMetadata, format!("metadata at {url} is not UTF-8"))
    })
}

/// Fetches metadata over HTTP with a bounded timeout and body size.
#[derive(Debug, Clone)]
pub struct HttpMetadataFetcher {
    client: Client,
    restrict_http: bool,
    check_signature: bool,
    max_document_size: u64,
}

impl HttpMetadataFetcher {
    pub fn new(config: &MetadataConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("cannot build metadata client: {e}")))?;
        Ok(Self {
            client,
            restrict_http: config.restrict_http,
            check_signature: config.check_signature,
            max_document_size: config.max_document_size,
        })
    }

    fn check_url(&self, url: &str) -> EngineResult<Url> {
        let parsed = Url::parse(url).map_err(|e| {
            EngineError::metadata(ErrorKey::SamlEngineNoMetadata, format!("invalid metadata url {url}: {e}"))
        })?;
        let allowed = match parsed.scheme() {
            "https" => true,
            "http" => !self.restrict_http,
            _ => false,
        };
        if !allowed {
            return Err(EngineError::metadata(
                ErrorKey::SamlEngineNoMetadata,
                format!("metadata url scheme {} not allowed", parsed.scheme()),
            ));
        }
        Ok(parsed)
    }
}

impl MetadataFetcher for HttpMetadataFetcher {
    fn get_eidas_metadata(
        &self,
        url: &str,
        signer: &dyn MetadataSigner,
        clock: &dyn MetadataClock,
    ) -> EngineResult<EidasMetadataParameters> {
        let location = self.check_url(url)?;
        debug!(url, "fetching metadata");
        let response = self.client.get(location).send()?.error_for_status()?;
        if response
            .content_length()
            .is_some_and(|length| length > self.max_document_size)
        {
            warn!(url, "metadata document too large");
            return Err(EngineError::metadata(
                ErrorKey::SamlEngineInvalidMetadata,
                format!("metadata at {url} exceeds {} bytes", self.max_document_size),
            ));
        }
        let xml = read_bounded(url, response, self.max_document_size)?;
        process_metadata(url, &xml, self.check_signature, signer, clock)
    }
}

/// Metadata documents held in memory, keyed by URL.
#[derive(Debug, Clone)]
pub struct InMemoryMetadataFetcher {
    documents: HashMap<String, String>,
    check_signature: bool,
}

impl Default for InMemoryMetadataFetcher {
    fn default() -> Self {
        Self {
            documents: HashMap::new(),
            check_signature: true,
        }
    }
}

impl InMemoryMetadataFetcher {
    pub fn with_document(mut self, url: &str, xml: String) -> Self {
        self.documents.insert(url.to_string(), xml);
        self
    }

    pub fn check_signature(self, check_signature: bool) -> Self {
        Self {
            check_signature,
            ..self
        }
    }
}

impl MetadataFetcher for InMemoryMetadataFetcher {
    fn get_eidas_metadata(
        &self,
        url: &str,
        signer: &dyn MetadataSigner,
        clock: &dyn MetadataClock,
    ) -> EngineResult<EidasMetadataParameters> {
        let xml = self.documents.get(url).ok_or_else(|| {
            EngineError::metadata(ErrorKey::SamlEngineNoMetadata, format!("no metadata for {url}"))
        })?;
        process_metadata(url, xml, self.check_signature, signer, clock)
    }
}

/// Serves verified metadata from a cache, fetching on a miss or once the
/// cached copy has passed its `validUntil`.
pub struct CachingMetadataFetcher<F, C> {
    fetcher: F,
    cache: C,
}

impl<F: MetadataFetcher, C: MetadataCache> CachingMetadataFetcher<F, C> {
    pub fn new(fetcher: F, cache: C) -> Self {
        Self { fetcher, cache }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }
}

impl<F: MetadataFetcher, C: MetadataCache> MetadataFetcher for CachingMetadataFetcher<F, C> {
    fn get_eidas_metadata(
        &self,
        url: &str,
        signer: &dyn MetadataSigner,
        clock: &dyn MetadataClock,
    ) -> EngineResult<EidasMetadataParameters> {
        if let Some(cached) = self.cache.get_eidas_metadata_parameters(url)? {
            if !is_expired(&cached, clock) {
                return Ok(cached);
            }
            info!(url, "cached metadata expired");
            self.cache.put_eidas_metadata_parameters(url, None)?;
        }
        let parameters = self.fetcher.get_eidas_metadata(url, signer, clock)?;
        self.cache
            .put_eidas_metadata_parameters(url, Some(parameters.clone()))?;
        Ok(parameters)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::Duration as TimeDuration;

    use super::*;
    use crate::{
        crypto::{test_support::rsa_credential, CertificateValidator, ProtocolSigner, SignatureAlgorithm},
        metadata::{generate_metadata, InMemoryMetadataCache, ProtocolMetadataSigner},
    };

    const URL: &str = "https://proxy.be/metadata";

    struct FixedClock(OffsetDateTime);

    impl MetadataClock for FixedClock {
        fn now(&self) -> OffsetDateTime {
            self.0
        }
    }

    fn metadata_signer(common_name: &str) -> ProtocolMetadataSigner {
        let credential = rsa_credential(common_name);
        let trusted = vec![credential.certificate().clone()];
        let signer = ProtocolSigner::new(
            credential,
            SignatureAlgorithm::RsaSha256,
            SignatureAlgorithm::ALL.to_vec(),
            CertificateValidator::default(),
        )
        .unwrap();
        ProtocolMetadataSigner::new(signer, trusted)
    }

    fn signed_metadata(signer: &ProtocolMetadataSigner, entity_id: &str) -> String {
        let parameters = EidasMetadataParameters::builder()
            .entity_id(entity_id)
            .valid_until(OffsetDateTime::now_utc() + TimeDuration::days(1))
            .build()
            .unwrap();
        generate_metadata(&parameters, signer).unwrap()
    }

    #[test]
    fn can_fetch_signed_metadata() {
        let signer = metadata_signer("proxy.be");
        let fetcher = InMemoryMetadataFetcher::default().with_document(URL, signed_metadata(&signer, URL));
        let parameters = fetcher.get_eidas_metadata(URL, &signer, &SystemClock).unwrap();
        assert_eq!(parameters.entity_id, URL);
    }

    #[test]
    fn can_reject_forged_or_unsigned_metadata() {
        let signer = metadata_signer("proxy.be");
        let forger = metadata_signer("forger.be");
        let fetcher = InMemoryMetadataFetcher::default().with_document(URL, signed_metadata(&forger, URL));
        assert!(matches!(
            fetcher.get_eidas_metadata(URL, &signer, &SystemClock),
            Err(EngineError::InvalidSignature { .. })
        ));

        let unsigned = format!(r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{URL}"/>"#);
        let fetcher = InMemoryMetadataFetcher::default().with_document(URL, unsigned.clone());
        assert!(matches!(
            fetcher.get_eidas_metadata(URL, &signer, &SystemClock),
            Err(EngineError::MissingSignature(_))
        ));
        let fetcher = fetcher.check_signature(false);
        assert!(fetcher.get_eidas_metadata(URL, &signer, &SystemClock).is_ok());
    }

    #[test]
    fn can_reject_expired_or_mismatched_metadata() {
        let signer = metadata_signer("proxy.be");
        let fetcher = InMemoryMetadataFetcher::default()
            .with_document(URL, signed_metadata(&signer, URL))
            .with_document("https://other.be/metadata", signed_metadata(&signer, URL));
        let later = FixedClock(OffsetDateTime::now_utc() + TimeDuration::days(2));
        assert!(fetcher.get_eidas_metadata(URL, &signer, &later).is_err());
        assert!(fetcher
            .get_eidas_metadata("https://other.be/metadata", &signer, &SystemClock)
            .is_err());
        assert_eq!(
            fetcher
                .get_eidas_metadata("https://unknown.be/metadata", &signer, &SystemClock)
                .unwrap_err()
                .key(),
            ErrorKey::SamlEngineNoMetadata
        );
    }

    #[test]
    fn can_cache_fetched_metadata() {
        let signer = metadata_signer("proxy.be");
        let fetcher = CachingMetadataFetcher::new(
            InMemoryMetadataFetcher::default().with_document(URL, signed_metadata(&signer, URL)),
            InMemoryMetadataCache::new(Duration::from_secs(60), 10),
        );
        assert!(fetcher.cache().get_eidas_metadata_parameters(URL).unwrap().is_none());
        fetcher.get_eidas_metadata(URL, &signer, &SystemClock).unwrap();
        assert!(fetcher.cache().get_eidas_metadata_parameters(URL).unwrap().is_some());
    }

    #[test]
    fn can_restrict_metadata_urls_to_https() {
        let fetcher = HttpMetadataFetcher::new(&MetadataConfig::default()).unwrap();
        assert!(fetcher.check_url("https://proxy.be/metadata").is_ok());
        assert!(fetcher.check_url("http://proxy.be/metadata").is_err());
        assert!(fetcher.check_url("ftp://proxy.be/metadata").is_err());
        assert!(fetcher.check_url("not a url").is_err());

        let relaxed = HttpMetadataFetcher::new(&MetadataConfig {
            restrict_http: false,
            ..MetadataConfig::default()
        })
        .unwrap();
        assert!(relaxed.check_url("http://proxy.be/metadata").is_ok());
    }

    #[test]
    fn can_bound_metadata_document_size() {
        let body = "<md:EntityDescriptor/>";
        let limit = body.len() as u64;
        assert_eq!(read_bounded(URL, body.as_bytes(), limit).unwrap(), body);

        let err = read_bounded(URL, body.as_bytes(), limit - 1).unwrap_err();
        assert_eq!(err.key(), ErrorKey::SamlEngineInvalidMetadata);

        let err = read_bounded(URL, &[0xff_u8, 0xfe][..], limit).unwrap_err();
        assert_eq!(err.key(), ErrorKey::SamlEngineInvalidMetadata);
    }
}
