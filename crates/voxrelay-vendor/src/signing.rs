//! Signed connection URLs for the two vendors.
//!
//! Both vendors authenticate the WebSocket upgrade through query parameters
//! derived from an HMAC over request metadata. A URL is signed once per
//! connection, when the pool creates it.

use crate::config::{RecognitionConfig, SynthesisConfig};
use crate::error::VoiceError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::collections::BTreeMap;
use url::Url;

/// Offset used in the recognition vendor's `utc` parameter (UTC+8).
const RECOGNITION_UTC_OFFSET_SECS: i64 = 8 * 3600;

/// Produces a freshly signed vendor URL for a new connection.
pub trait UrlSigner: Send + Sync {
    fn signed_url(&self) -> Result<String, VoiceError>;
}

fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Joins `key=value` pairs in key order, URL-encoding both sides.
///
/// The `signature` entry and empty values are skipped, which is exactly the
/// string the recognition vendor signs.
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(key, value)| key.as_str() != "signature" && !value.trim().is_empty())
        .map(|(key, value)| format!("{}={}", form_encode(key), form_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", form_encode(key), form_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Base64 of HMAC-SHA1(`secret`, `data`).
pub fn hmac_sha1_base64(secret: &str, data: &str) -> Result<String, VoiceError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .map_err(|e| VoiceError::Auth(format!("invalid signing key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Base64 of HMAC-SHA256(`secret`, `data`).
pub fn hmac_sha256_base64(secret: &str, data: &str) -> Result<String, VoiceError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| VoiceError::Auth(format!("invalid signing key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Formats `now` as `yyyy-MM-ddTHH:mm:ss+0800`.
pub fn recognition_timestamp(now: DateTime<Utc>) -> String {
    (now + TimeDelta::seconds(RECOGNITION_UTC_OFFSET_SECS))
        .format("%Y-%m-%dT%H:%M:%S+0800")
        .to_string()
}

/// Formats `now` as an RFC 1123 date in GMT.
pub fn rfc1123_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Signs recognition URLs with HMAC-SHA1 over the sorted query string.
#[derive(Debug, Clone)]
pub struct RecognitionSigner {
    config: RecognitionConfig,
}

impl RecognitionSigner {
    pub fn new(config: RecognitionConfig) -> Self {
        Self { config }
    }

    /// Query parameters before signing.
    pub fn params(&self, utc: &str, uuid: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("audio_encode".to_string(), self.config.audio_encode.clone());
        params.insert("lang".to_string(), self.config.lang.clone());
        params.insert("samplerate".to_string(), self.config.sample_rate.to_string());
        params.insert("accessKeyId".to_string(), self.config.access_key_id.clone());
        params.insert("appId".to_string(), self.config.app_id.clone());
        params.insert("uuid".to_string(), uuid.to_string());
        params.insert("utc".to_string(), utc.to_string());
        params
    }

    /// Builds the signed URL for a fixed clock and nonce.
    pub fn sign_at(&self, now: DateTime<Utc>, uuid: &str) -> Result<String, VoiceError> {
        if self.config.access_key_id.is_empty() || self.config.access_key_secret.is_empty() {
            return Err(VoiceError::Auth(
                "recognition access key id/secret not configured".to_string(),
            ));
        }

        let mut params = self.params(&recognition_timestamp(now), uuid);
        let signature = hmac_sha1_base64(&self.config.access_key_secret, &canonical_query(&params))?;
        params.insert("signature".to_string(), signature);

        Ok(format!("{}?{}", self.config.url, encode_query(&params)))
    }
}

impl UrlSigner for RecognitionSigner {
    fn signed_url(&self) -> Result<String, VoiceError> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        self.sign_at(Utc::now(), &nonce)
    }
}

/// Signs synthesis URLs with HMAC-SHA256 over host, date and request line.
#[derive(Debug, Clone)]
pub struct SynthesisSigner {
    config: SynthesisConfig,
}

impl SynthesisSigner {
    pub fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    pub fn sign_at(&self, now: DateTime<Utc>) -> Result<String, VoiceError> {
        if self.config.api_key.is_empty() || self.config.api_secret.is_empty() {
            return Err(VoiceError::Auth(
                "synthesis api key/secret not configured".to_string(),
            ));
        }

        let mut url = Url::parse(&self.config.url)
            .map_err(|e| VoiceError::Config(format!("invalid synthesis url: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| VoiceError::Config("synthesis url has no host".to_string()))?
            .to_string();
        let date = rfc1123_date(now);

        let signature_origin = format!(
            "host: {}\ndate: {}\nGET {} HTTP/1.1",
            host,
            date,
            url.path()
        );
        let signature = hmac_sha256_base64(&self.config.api_secret, &signature_origin)?;
        let authorization_origin = format!(
            "hmac username=\"{}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{}\"",
            self.config.api_key, signature
        );
        let authorization = STANDARD.encode(authorization_origin.as_bytes());

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| VoiceError::Config(format!("cannot use {} scheme", scheme)))?;
        url.query_pairs_mut()
            .append_pair("authorization", &authorization)
            .append_pair("date", &date)
            .append_pair("host", &host);

        Ok(url.to_string())
    }
}

impl UrlSigner for SynthesisSigner {
    fn signed_url(&self) -> Result<String, VoiceError> {
        self.sign_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 2, 3, 4).unwrap()
    }

    fn recognition_config() -> RecognitionConfig {
        RecognitionConfig {
            app_id: "app123".to_string(),
            access_key_id: "ak".to_string(),
            access_key_secret: "sk".to_string(),
            ..RecognitionConfig::default()
        }
    }

    #[test]
    fn hmac_sha1_known_vector() {
        let sig = hmac_sha1_base64("key", "The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(sig, "3nybhbi3iqa8ino29wqQcBydtNk=");
    }

    #[test]
    fn timestamps_use_expected_zones() {
        assert_eq!(recognition_timestamp(fixed_now()), "2024-05-01T10:03:04+0800");
        assert_eq!(rfc1123_date(fixed_now()), "Wed, 01 May 2024 02:03:04 GMT");
    }

    #[test]
    fn canonical_query_is_sorted_and_skips_signature_and_empty_values() {
        let mut params = BTreeMap::new();
        params.insert("utc".to_string(), "a b".to_string());
        params.insert("appId".to_string(), "x".to_string());
        params.insert("signature".to_string(), "zzz".to_string());
        params.insert("empty".to_string(), "  ".to_string());
        assert_eq!(canonical_query(&params), "appId=x&utc=a+b");
    }

    #[test]
    fn recognition_url_matches_reference_signature() {
        let signer = RecognitionSigner::new(recognition_config());
        let url = signer
            .sign_at(fixed_now(), "0123456789abcdef0123456789abcdef")
            .unwrap();
        assert_eq!(
            url,
            "wss://office-api-ast-dx.iflyaisol.com/ast/communicate/v1?\
             accessKeyId=ak&appId=app123&audio_encode=pcm_s16le&lang=autodialect\
             &samplerate=16000&signature=WiKS7YRQfCEmFseQZDT81PBkhFE%3D\
             &utc=2024-05-01T10%3A03%3A04%2B0800&uuid=0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn recognition_nonce_is_fresh_per_url() {
        let signer = RecognitionSigner::new(recognition_config());
        let a = signer.signed_url().unwrap();
        let b = signer.signed_url().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn recognition_without_credentials_is_auth_error() {
        let signer = RecognitionSigner::new(RecognitionConfig::default());
        match signer.signed_url() {
            Err(VoiceError::Auth(_)) => {}
            other => panic!("Expected Auth error, got {:?}", other),
        }
    }

    #[test]
    fn synthesis_url_carries_authorization_date_and_host() {
        let signer = SynthesisSigner::new(SynthesisConfig {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            ..SynthesisConfig::default()
        });
        let signed = Url::parse(&signer.sign_at(fixed_now()).unwrap()).unwrap();

        assert_eq!(signed.scheme(), "wss");
        assert_eq!(signed.host_str(), Some("cbm01.cn-huabei-1.xf-yun.com"));
        assert_eq!(signed.path(), "/v1/private/mcd9m97e6");

        let pairs: BTreeMap<String, String> = signed.query_pairs().into_owned().collect();
        assert_eq!(pairs["date"], "Wed, 01 May 2024 02:03:04 GMT");
        assert_eq!(pairs["host"], "cbm01.cn-huabei-1.xf-yun.com");

        let header = String::from_utf8(STANDARD.decode(&pairs["authorization"]).unwrap()).unwrap();
        assert_eq!(
            header,
            "hmac username=\"key\", algorithm=\"hmac-sha256\", \
             headers=\"host date request-line\", \
             signature=\"EmdocV6XeHPSgrRYpc4c923vf4SYNPzVF1SgVGAdJzs=\""
        );
    }

    #[test]
    fn synthesis_rejects_unparseable_url() {
        let signer = SynthesisSigner::new(SynthesisConfig {
            url: "not a url".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            ..SynthesisConfig::default()
        });
        assert!(matches!(signer.sign_at(fixed_now()), Err(VoiceError::Config(_))));
    }
}
