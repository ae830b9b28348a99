//! Client SDK for the registration API. Wallet software constructs the
//! request, the SDK signs it with the caller-provided signer, posts it,
//! verifies the server's Ed25519 signature over the exact response body
//! and checks the echoed request for tampering.

use crate::api::{
    EchoesRequest, FeeAddressRequest, FeeAddressResponse, PayFeeRequest, PayFeeResponse,
    SetAltSignAddrRequest, SetAltSignAddrResponse, SetVoteChoicesRequest, SetVoteChoicesResponse,
    TicketStatusRequest, TicketStatusResponse, VspInfoResponse, CLIENT_SIGNATURE_HEADER,
    SERVER_SIGNATURE_HEADER,
};
use crate::chain;
use crate::errors::ErrorResponse;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::header::CONTENT_TYPE;
use secp256k1::SecretKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with its typed error envelope.
    #[error("{0}")]
    Api(#[from] ErrorResponse),

    #[error("authenticate server response: no signature provided")]
    NoServerSignature,

    #[error("authenticate server response: failed to decode signature: {0}")]
    DecodeServerSignature(base64::DecodeError),

    #[error("authenticate server response: invalid signature")]
    InvalidServerSignature,

    #[error("server response contains differing request")]
    RequestMismatch,

    /// Non-200 with a body that is not the typed envelope.
    #[error("{status}: {body}")]
    Http { status: u16, body: String },

    /// Non-200 with an empty body.
    #[error("{0}")]
    Status(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("cannot encode request: {0}")]
    Encode(String),

    #[error("cannot decode response: {0}")]
    Decode(String),

    #[error("signer: {0}")]
    Signer(String),
}

impl ClientError {
    /// The machine-readable code from the server's error envelope, when
    /// there is one.
    pub fn api_code(&self) -> Option<i32> {
        match self {
            ClientError::Api(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Signs marshalled request bytes with the private key controlling the
/// ticket's commitment address (or its alternate signing address).
pub trait RequestSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ClientError>;
}

impl<F> RequestSigner for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, ClientError>,
{
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ClientError> {
        self(message)
    }
}

/// Ready-made signer over a raw commitment-address secret key.
pub struct CommitmentSigner {
    sk: SecretKey,
}

impl CommitmentSigner {
    pub fn new(sk: SecretKey) -> Self {
        CommitmentSigner { sk }
    }
}

impl RequestSigner for CommitmentSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ClientError> {
        Ok(chain::sign_message(message, &self.sk))
    }
}

pub struct VspClient {
    http: reqwest::Client,
    base_url: String,
    pub_key: VerifyingKey,
}

impl VspClient {
    pub fn new(url: &str, server_pub_key: [u8; 32]) -> Result<VspClient, ClientError> {
        let pub_key = VerifyingKey::from_bytes(&server_pub_key)
            .map_err(|e| ClientError::Decode(format!("bad server pubkey: {}", e)))?;
        Ok(VspClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            base_url: url.trim_end_matches('/').to_owned(),
            pub_key,
        })
    }

    pub async fn vsp_info(&self) -> Result<VspInfoResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v3/vspinfo", self.base_url))
            .send()
            .await?;
        self.verify_and_decode(response).await
    }

    pub async fn fee_address(
        &self,
        request: &FeeAddressRequest,
        signer: &dyn RequestSigner,
    ) -> Result<FeeAddressResponse, ClientError> {
        self.post("/api/v3/feeaddress", request, signer).await
    }

    pub async fn pay_fee(
        &self,
        request: &PayFeeRequest,
        signer: &dyn RequestSigner,
    ) -> Result<PayFeeResponse, ClientError> {
        self.post("/api/v3/payfee", request, signer).await
    }

    pub async fn ticket_status(
        &self,
        request: &TicketStatusRequest,
        signer: &dyn RequestSigner,
    ) -> Result<TicketStatusResponse, ClientError> {
        self.post("/api/v3/ticketstatus", request, signer).await
    }

    pub async fn set_vote_choices(
        &self,
        request: &SetVoteChoicesRequest,
        signer: &dyn RequestSigner,
    ) -> Result<SetVoteChoicesResponse, ClientError> {
        self.post("/api/v3/setvotechoices", request, signer).await
    }

    pub async fn set_alt_sign_addr(
        &self,
        request: &SetAltSignAddrRequest,
        signer: &dyn RequestSigner,
    ) -> Result<SetAltSignAddrResponse, ClientError> {
        self.post("/api/v3/setaltsignaddr", request, signer).await
    }

    async fn post<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        signer: &dyn RequestSigner,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + EchoesRequest,
    {
        let body = serde_json::to_vec(request).map_err(|e| ClientError::Encode(e.to_string()))?;
        let signature = base64::encode(signer.sign(&body)?);

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(CLIENT_SIGNATURE_HEADER, signature)
            .header(CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await?;
        let parsed: Resp = self.verify_and_decode(response).await?;

        if parsed.echoed_request().get().as_bytes() != body.as_slice() {
            return Err(ClientError::RequestMismatch);
        }
        Ok(parsed)
    }

    async fn verify_and_decode<Resp: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Resp, ClientError> {
        let status = response.status();
        let signature_header = response
            .headers()
            .get(SERVER_SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?;

        if status.as_u16() != 200 {
            if body.is_empty() {
                return Err(ClientError::Status(status.to_string()));
            }
            if let Ok(envelope) = serde_json::from_slice::<ErrorResponse>(&body) {
                return Err(ClientError::Api(envelope));
            }
            return Err(ClientError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let signature_b64 = signature_header
            .filter(|s| !s.is_empty())
            .ok_or(ClientError::NoServerSignature)?;
        let signature_bytes =
            base64::decode(&signature_b64).map_err(ClientError::DecodeServerSignature)?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| ClientError::InvalidServerSignature)?;
        self.pub_key
            .verify(&body, &signature)
            .map_err(|_| ClientError::InvalidServerSignature)?;

        serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}
