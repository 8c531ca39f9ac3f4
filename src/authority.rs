//! Tax authority (NFS-e) lookup client.
//!
//! Resolves one document number into its authority-side XML and PDF
//! artifacts through a three-step chained protocol, all over HTTPS with
//! mutual TLS via a PKCS#12 client certificate:
//!
//! 1. Derive the authority-internal DPS identifier (no network call):
//!    configured prefix + document number zero-padded to 17 digits.
//! 2. `GET {dps_url}/{identifier}` → access key. A 404 means "this document
//!    has no authority record" and is a valid empty result, not an error.
//! 3. `GET {nfse_url}/{access key}` → JSON body whose `nfseXmlGZipB64`
//!    field holds the record XML, Base64-encoded then GZip-compressed.
//! 4. `GET {danfse_url}/{access key}` → rendered PDF bytes.
//!
//! Network failures here are **not** retried: repeated certificate-
//! authenticated calls against an external authority are costly, and retry
//! policy belongs to the caller. The certificate bundle is loaded once at
//! construction and reused for every call.

use std::fmt;
use std::io::Read;
use std::time::Duration;

use base64::Engine;
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::config::{AuthorityConfig, CertificateConfig};
use crate::models::{canonical_number, normalize_number, TaxRecord};

/// Width the document number is zero-padded to inside the DPS identifier.
pub const DPS_NUMBER_WIDTH: usize = 17;

/// Per-document lookup failures. `Decode` marks an unexpected response
/// format and must never be retried; `Certificate` aborts the whole batch
/// when raised at construction time.
#[derive(Debug)]
pub enum LookupError {
    /// The PKCS#12 bundle could not be loaded, or the authority rejected it.
    Certificate(String),
    /// Non-2xx response that is not a "no record" answer.
    Http { status: u16, body: String },
    /// Transport-level failure reaching the authority.
    Network(String),
    /// The per-call timeout elapsed. Terminal for this document only.
    Timeout,
    /// Malformed payload (Base64/GZip/JSON/PDF sniffing).
    Decode(String),
    /// A 2xx response missing the field the protocol promises.
    MissingField(&'static str),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Certificate(e) => write!(f, "client certificate: {}", e),
            LookupError::Http { status, body } => {
                write!(f, "authority returned HTTP {}: {}", status, body)
            }
            LookupError::Network(e) => write!(f, "authority unreachable: {}", e),
            LookupError::Timeout => write!(f, "authority call timed out"),
            LookupError::Decode(e) => write!(f, "malformed authority payload: {}", e),
            LookupError::MissingField(field) => {
                write!(f, "authority response is missing field '{}'", field)
            }
        }
    }
}

impl std::error::Error for LookupError {}

#[derive(Deserialize)]
struct AccessKeyResponse {
    #[serde(rename = "chaveAcesso")]
    access_key: String,
}

#[derive(Deserialize)]
struct RecordResponse {
    #[serde(rename = "nfseXmlGZipB64")]
    xml_gzip_b64: String,
}

/// Client for the authority's three endpoints. Cheap to clone through `Arc`;
/// the inner `reqwest::Client` pools connections.
pub struct TaxAuthorityClient {
    http: reqwest::Client,
    dps_url: String,
    nfse_url: String,
    danfse_url: String,
    prefix: String,
}

impl TaxAuthorityClient {
    /// Build a client. When a certificate is configured the PKCS#12 bundle
    /// is loaded here, once; a load failure is fatal for every lookup of the
    /// session. Without a certificate the client speaks plain HTTPS, which
    /// real authority endpoints will reject; useful only against test
    /// servers.
    pub fn new(
        authority: &AuthorityConfig,
        certificate: Option<&CertificateConfig>,
        timeout: Duration,
    ) -> Result<Self, LookupError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(cert) = certificate {
            let bundle = std::fs::read(&cert.path).map_err(|e| {
                LookupError::Certificate(format!("read {}: {}", cert.path.display(), e))
            })?;
            let identity = reqwest::Identity::from_pkcs12_der(&bundle, &cert.password)
                .map_err(|e| LookupError::Certificate(e.to_string()))?;
            builder = builder.identity(identity).use_native_tls();
        }
        let http = builder
            .build()
            .map_err(|e| LookupError::Network(e.to_string()))?;

        Ok(Self {
            http,
            dps_url: authority.dps_url.trim_end_matches('/').to_string(),
            nfse_url: authority.nfse_url.trim_end_matches('/').to_string(),
            danfse_url: authority.danfse_url.trim_end_matches('/').to_string(),
            prefix: authority.dps_prefix.clone(),
        })
    }

    /// Derive the authority-internal DPS identifier for a document number.
    /// Deterministic, no network. `None` when the number has no digits.
    pub fn dps_id(&self, number: &str) -> Option<String> {
        let digits = normalize_number(number);
        if digits.is_empty() {
            return None;
        }
        Some(format!(
            "{}{:0>width$}",
            self.prefix,
            digits,
            width = DPS_NUMBER_WIDTH
        ))
    }

    /// Step 2: resolve the access key. `Ok(None)` when the authority has no
    /// record for this identifier.
    pub async fn resolve_access_key(&self, dps_id: &str) -> Result<Option<String>, LookupError> {
        let url = format!("{}/{}", self.dps_url, dps_id);
        let response = self.http.get(&url).send().await.map_err(map_reqwest)?;
        match response.status().as_u16() {
            200 => {
                let body: AccessKeyResponse = response
                    .json()
                    .await
                    .map_err(|_| LookupError::MissingField("chaveAcesso"))?;
                Ok(Some(body.access_key))
            }
            404 => Ok(None),
            status => Err(http_error(status, response).await),
        }
    }

    /// Step 3: fetch and decode the record XML.
    pub async fn fetch_xml(&self, access_key: &str) -> Result<String, LookupError> {
        let url = format!("{}/{}", self.nfse_url, access_key);
        let response = self.http.get(&url).send().await.map_err(map_reqwest)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(http_error(status, response).await);
        }
        let body: RecordResponse = response
            .json()
            .await
            .map_err(|_| LookupError::MissingField("nfseXmlGZipB64"))?;
        decode_gzip_base64(&body.xml_gzip_b64)
    }

    /// Step 4: fetch the rendered PDF. The body is the PDF bytes directly.
    pub async fn fetch_pdf(&self, access_key: &str) -> Result<Vec<u8>, LookupError> {
        let url = format!("{}/{}", self.danfse_url, access_key);
        let response = self.http.get(&url).send().await.map_err(map_reqwest)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(http_error(status, response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(map_reqwest)?
            .to_vec();
        if !bytes.starts_with(b"%PDF") {
            return Err(LookupError::Decode("response is not a PDF document".into()));
        }
        Ok(bytes)
    }

    /// Full chain for one document number. `Ok(None)` when the document has
    /// no authority counterpart. A PDF retrieval failure degrades to a
    /// record without the PDF slot; the XML is the load-bearing artifact.
    pub async fn lookup(&self, number: &str) -> Result<Option<TaxRecord>, LookupError> {
        let Some(dps_id) = self.dps_id(number) else {
            return Ok(None);
        };
        let Some(access_key) = self.resolve_access_key(&dps_id).await? else {
            tracing::debug!("no authority record for document {}", number);
            return Ok(None);
        };
        let xml = self.fetch_xml(&access_key).await?;
        let pdf = match self.fetch_pdf(&access_key).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("PDF retrieval for document {} failed: {}", number, e);
                None
            }
        };

        let customer_name = xml_path_text(&xml, &["toma", "xNome"]);
        let issue_date = xml_path_text(&xml, &["infDPS", "dhEmi"]);

        Ok(Some(TaxRecord {
            number: canonical_number(number),
            access_key,
            xml,
            pdf,
            customer_name,
            issue_date,
        }))
    }
}

fn map_reqwest(e: reqwest::Error) -> LookupError {
    if e.is_timeout() {
        LookupError::Timeout
    } else {
        LookupError::Network(e.to_string())
    }
}

async fn http_error(status: u16, response: reqwest::Response) -> LookupError {
    let body = response.text().await.unwrap_or_default();
    match status {
        401 | 403 => LookupError::Certificate(format!(
            "authority rejected the client certificate (HTTP {})",
            status
        )),
        _ => LookupError::Http {
            status,
            body: body.chars().take(200).collect(),
        },
    }
}

/// Decode a Base64(GZip(text)) payload: Base64 first, then decompress.
pub fn decode_gzip_base64(encoded: &str) -> Result<String, LookupError> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| LookupError::Decode(format!("base64: {}", e)))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .map_err(|e| LookupError::Decode(format!("gzip: {}", e)))?;
    Ok(text)
}

/// Text of the first element whose enclosing element path ends with `path`
/// (e.g. `["toma", "xNome"]` finds `<toma><xNome>…</xNome></toma>` at any
/// depth). The payloads carry a handful of known fields, so a path lookup is
/// all that is needed, no schema handling.
pub fn xml_path_text(xml: &str, path: &[&str]) -> Option<String> {
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(quick_xml::events::Event::End(_)) => {
                stack.pop();
            }
            Ok(quick_xml::events::Event::Text(t)) if path_matches(&stack, path) => {
                let text = t.unescape().ok()?.trim().to_string();
                if !text.is_empty() {
                    return Some(text);
                }
            }
            Ok(quick_xml::events::Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn path_matches(stack: &[String], path: &[&str]) -> bool {
    stack.len() >= path.len()
        && stack[stack.len() - path.len()..]
            .iter()
            .zip(path)
            .all(|(have, want)| have == want)
}
