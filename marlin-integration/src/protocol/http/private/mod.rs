use self::encoder::Encoder;
use super::{BuildStrategy, rest::RestRequest};
use crate::error::SocketError;
use hmac::Mac;

/// Defines an [`Encoder`] for signature bytes, with `Hex` & `Base64` implementations.
pub mod encoder;

/// Defines how to sign a [`RestRequest`] for a specific API.
///
/// Each API requires a specific set of bytes to be signed, and a specific way to attach the
/// resulting signature to the request (headers, query parameters, etc.).
pub trait Signer {
    /// Data required to sign the request, usually constructed from the [`RestRequest`] itself.
    type Config<'a>
    where
        Self: 'a;

    /// Construct the [`Self::Config`] required to sign the provided [`RestRequest`].
    fn config<'a, Request>(
        &'a self,
        request: Request,
        builder: &reqwest::RequestBuilder,
    ) -> Result<Self::Config<'a>, SocketError>
    where
        Request: RestRequest;

    /// Feed the API specific bytes to be signed into the provided [`Mac`].
    fn add_bytes_to_sign<M>(mac: &mut M, config: &Self::Config<'_>)
    where
        M: Mac;

    /// Attach the signature to the request and build the final [`reqwest::Request`].
    fn build_signed_request(
        config: Self::Config<'_>,
        builder: reqwest::RequestBuilder,
        signature: String,
    ) -> Result<reqwest::Request, SocketError>;
}

/// [`BuildStrategy`] that signs a [`RestRequest`] using API specific [`Signer`] logic, a
/// hashable [`Mac`], and a signature [`Encoder`].
#[derive(Debug, Clone)]
pub struct RequestSigner<Sig, HmacMac, SignatureEncoder> {
    signer: Sig,
    mac: HmacMac,
    encoder: SignatureEncoder,
}

impl<Sig, HmacMac, SignatureEncoder> RequestSigner<Sig, HmacMac, SignatureEncoder> {
    /// Construct a new [`Self`] using the provided configuration.
    pub fn new(signer: Sig, mac: HmacMac, encoder: SignatureEncoder) -> Self {
        Self {
            signer,
            mac,
            encoder,
        }
    }
}

impl<Sig, HmacMac, SignatureEncoder> BuildStrategy for RequestSigner<Sig, HmacMac, SignatureEncoder>
where
    Sig: Signer,
    HmacMac: Mac + Clone,
    SignatureEncoder: Encoder,
{
    fn build<Request>(
        &self,
        request: Request,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Request, SocketError>
    where
        Request: RestRequest,
    {
        // Construct the API specific data to sign
        let config = self.signer.config(request, &builder)?;

        // Sign with a fresh Mac so no state leaks between requests
        let mut mac = self.mac.clone();
        Sig::add_bytes_to_sign(&mut mac, &config);
        let signature = self.encoder.encode(mac.finalize().into_bytes());

        Sig::build_signed_request(config, builder, signature)
    }
}
