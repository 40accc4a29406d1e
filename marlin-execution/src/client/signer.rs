use chrono::Utc;
use derive_more::Constructor;
use marlin_integration::{
    error::SocketError,
    protocol::http::{
        private::{RequestSigner, Signer, encoder::Base64Encoder},
        rest::RestRequest,
    },
};

/// Signer for the exchange's `CB-ACCESS-*` authentication scheme.
pub type ExchangeRequestSigner = RequestSigner<ExchangeSigner, hmac::Hmac<sha2::Sha256>, Base64Encoder>;

#[derive(Debug, Clone, Constructor)]
pub struct ExchangeSigner {
    pub api_key: String,
    pub passphrase: String,
}

pub struct ExchangeSignConfig<'a> {
    api_key: &'a str,
    passphrase: &'a str,
    timestamp: String,
    method: reqwest::Method,
    path: String,
    body_to_sign: Option<String>,
}

impl Signer for ExchangeSigner {
    type Config<'a>
        = ExchangeSignConfig<'a>
    where
        Self: 'a;

    fn config<'a, Request>(
        &'a self,
        request: Request,
        _builder: &reqwest::RequestBuilder,
    ) -> Result<Self::Config<'a>, SocketError>
    where
        Request: RestRequest,
    {
        // The signed path must match the request path, query string included
        let path = match request.query_params() {
            Some(params) => format!(
                "{}?{}",
                request.path(),
                serde_urlencoded::to_string(params)?
            ),
            None => request.path().into_owned(),
        };

        let body_to_sign = request
            .body()
            .map(|body| serde_json::to_string(body))
            .transpose()
            .map_err(SocketError::Serialise)?;

        Ok(Self::Config {
            api_key: self.api_key.as_str(),
            passphrase: self.passphrase.as_str(),
            timestamp: Utc::now().timestamp().to_string(),
            method: Request::method(),
            path,
            body_to_sign,
        })
    }

    fn add_bytes_to_sign<M>(mac: &mut M, config: &Self::Config<'_>)
    where
        M: hmac::Mac,
    {
        // The message being signed is "{timestamp}{method}{path}{body}"
        mac.update(config.timestamp.as_bytes());
        mac.update(config.method.as_str().as_bytes());
        mac.update(config.path.as_bytes());
        if let Some(body) = &config.body_to_sign {
            mac.update(body.as_bytes());
        }
    }

    fn build_signed_request(
        config: Self::Config<'_>,
        builder: reqwest::RequestBuilder,
        signature: String,
    ) -> Result<reqwest::Request, SocketError> {
        const KEY_HEADER: &str = "CB-ACCESS-KEY";
        const SIGNATURE_HEADER: &str = "CB-ACCESS-SIGN";
        const TIMESTAMP_HEADER: &str = "CB-ACCESS-TIMESTAMP";
        const PASSPHRASE_HEADER: &str = "CB-ACCESS-PASSPHRASE";

        builder
            .header(KEY_HEADER, config.api_key)
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, config.timestamp)
            .header(PASSPHRASE_HEADER, config.passphrase)
            .build()
            .map_err(SocketError::from)
    }
}

/// Decode the profile's base64 API secret into raw HMAC key bytes.
///
/// Shared by the REST signer construction and the event stream subscription handshake.
pub fn decode_secret(b64_secret: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(b64_secret)
}
