//! RPC plumbing between the worker and the hosted enclave.
use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::time;
use tokio_util::sync::CancellationToken;

use keymanager_api::{
    types::{METHOD_GET_PUBLIC_EPHEMERAL_KEY, METHOD_GET_PUBLIC_KEY},
    KeyManagerError,
};

use crate::{access::PeerId, host::EnclaveHost, worker::Shared};

/// Timeout for enclave RPC calls.
const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Methods that bypass the access control gate irrespective of the calling
/// peer.
const PUBLIC_METHODS: &[&str] = &["", METHOD_GET_PUBLIC_KEY, METHOD_GET_PUBLIC_EPHEMERAL_KEY];

/// Kind of an enclave RPC call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, cbor::Encode, cbor::Decode)]
#[repr(u8)]
pub enum Kind {
    /// A Noise session call.
    NoiseSession = 0,
    /// An insecure query without a session.
    InsecureQuery = 1,
    /// A local query from the host.
    LocalQuery = 2,
}

/// Envelope of a local enclave RPC request.
#[derive(Clone, Debug, cbor::Encode, cbor::Decode)]
#[cbor(no_default)]
pub struct Request {
    /// Method name.
    pub method: String,
    /// Method arguments.
    pub args: cbor::Value,
}

/// Body of an enclave RPC response.
#[derive(Clone, Debug, cbor::Encode, cbor::Decode)]
pub enum Body {
    /// Call succeeded with the given result.
    Success(cbor::Value),
    /// Call failed with the given error message.
    Error(String),
}

/// Envelope of an enclave RPC response.
#[derive(Clone, Debug, cbor::Encode, cbor::Decode)]
#[cbor(no_default)]
pub struct Response {
    /// Response body.
    pub body: Body,
}

/// A Noise session frame as seen before dispatch.
///
/// The worker only inspects `untrusted_plaintext`; everything else is
/// consumed by the enclave session layer, which independently verifies that
/// the plaintext method matches the encrypted payload.
#[derive(Clone, Debug, Default, cbor::Encode, cbor::Decode)]
pub struct Frame {
    /// Session identifier.
    pub session: Vec<u8>,
    /// Plaintext method name advertised by the caller.
    pub untrusted_plaintext: String,
    /// Encrypted session payload.
    pub payload: Vec<u8>,
}

/// Client for dispatching RPC calls into the hosted enclave.
///
/// Noise session calls pass through a cheap outer access control gate; the
/// enclave re-checks policy independently.
pub(crate) struct EnclaveClient {
    host: Arc<dyn EnclaveHost>,
    shared: Shared,
    private_peers: HashSet<PeerId>,
    stopper: CancellationToken,
}

impl EnclaveClient {
    /// Create a new enclave client.
    pub(crate) fn new(
        host: Arc<dyn EnclaveHost>,
        shared: Shared,
        private_peers: HashSet<PeerId>,
        stopper: CancellationToken,
    ) -> Self {
        Self {
            host,
            shared,
            private_peers,
            stopper,
        }
    }

    /// Invoke a local enclave method.
    pub(crate) async fn call_local<Rq, Rs>(
        &self,
        method: &str,
        args: Rq,
    ) -> Result<Rs, KeyManagerError>
    where
        Rq: cbor::Encode,
        Rs: cbor::Decode,
    {
        let request = cbor::to_vec(Request {
            method: method.to_owned(),
            args: cbor::to_value(args),
        });
        let response = self.dispatch(Kind::LocalQuery, request).await?;

        let response: Response =
            cbor::from_slice(&response).map_err(|_| KeyManagerError::MalformedResponse)?;
        match response.body {
            Body::Success(value) => {
                cbor::from_value(value).map_err(|_| KeyManagerError::MalformedResponse)
            }
            Body::Error(err) => Err(KeyManagerError::EnclaveError(err)),
        }
    }

    /// Dispatch a Noise session frame on behalf of a remote peer.
    pub(crate) async fn call_session(
        &self,
        peer: &PeerId,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, KeyManagerError> {
        self.check_access(peer, &data)?;
        self.dispatch(Kind::NoiseSession, data).await
    }

    /// Dispatch an insecure query, bypassing access control.
    pub(crate) async fn call_insecure(&self, data: Vec<u8>) -> Result<Vec<u8>, KeyManagerError> {
        self.dispatch(Kind::InsecureQuery, data).await
    }

    async fn dispatch(&self, kind: Kind, request: Vec<u8>) -> Result<Vec<u8>, KeyManagerError> {
        tokio::select! {
            result = time::timeout(RPC_CALL_TIMEOUT, self.host.call(kind, request)) => {
                result.map_err(|_| KeyManagerError::Cancelled)?
            }
            _ = self.stopper.cancelled() => Err(KeyManagerError::Cancelled),
        }
    }

    /// Outer access control gate for Noise session calls.
    fn check_access(&self, peer: &PeerId, data: &[u8]) -> Result<(), KeyManagerError> {
        if self.private_peers.contains(peer) {
            return Ok(());
        }

        // Peek the frame to let public methods through.
        let frame: Frame =
            cbor::from_slice(data).map_err(|_| KeyManagerError::InvalidArgument)?;
        if PUBLIC_METHODS.contains(&frame.untrusted_plaintext.as_str()) {
            return Ok(());
        }

        let shared = self.shared.read().unwrap();
        if !shared.access_list.is_authorized(peer) {
            return Err(KeyManagerError::NotAuthorized);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::RwLock;

    use keymanager_api::crypto::signature::{MemorySigner, Signer};

    use super::*;
    use crate::{
        testing::MockEnclaveHost,
        worker::SharedState,
    };

    fn test_client(host: Arc<MockEnclaveHost>, private_peers: &[PeerId]) -> EnclaveClient {
        EnclaveClient::new(
            host,
            Arc::new(RwLock::new(SharedState::new())),
            private_peers.iter().copied().collect(),
            CancellationToken::new(),
        )
    }

    fn peer(seed: &str) -> PeerId {
        PeerId::from_public_key(&MemorySigner::from_test_seed(seed).public_key()).unwrap()
    }

    fn frame(method: &str) -> Vec<u8> {
        cbor::to_vec(Frame {
            session: vec![1; 32],
            untrusted_plaintext: method.to_owned(),
            payload: vec![2; 64],
        })
    }

    #[tokio::test]
    async fn test_local_call_envelopes() {
        let host = Arc::new(MockEnclaveHost::new([1; 32].into()));
        let client = test_client(host.clone(), &[]);

        // An error body surfaces as an enclave error.
        host.set_response(Response {
            body: Body::Error("something broke".into()),
        });
        let result: Result<cbor::Value, _> = client.call_local("test_method", 42u64).await;
        assert!(matches!(
            result,
            Err(KeyManagerError::EnclaveError(msg)) if msg == "something broke"
        ));

        // A response that is not a valid envelope is malformed.
        host.set_raw_response(b"definitely not cbor".to_vec());
        let result: Result<cbor::Value, _> = client.call_local("test_method", 42u64).await;
        assert!(matches!(result, Err(KeyManagerError::MalformedResponse)));
    }

    #[tokio::test]
    async fn test_session_access_gate() {
        let host = Arc::new(MockEnclaveHost::new([1; 32].into()));
        let private = peer("private peer");
        let client = test_client(host.clone(), &[private]);
        let unknown = peer("unknown peer");

        // Private peers bypass all checks.
        client
            .call_session(&private, frame("secret_method"))
            .await
            .unwrap();

        // Public methods pass for anyone.
        for method in ["", METHOD_GET_PUBLIC_KEY, METHOD_GET_PUBLIC_EPHEMERAL_KEY] {
            client.call_session(&unknown, frame(method)).await.unwrap();
        }

        // Unauthorized peers are rejected irrespective of the payload.
        assert!(matches!(
            client.call_session(&unknown, frame("secret_method")).await,
            Err(KeyManagerError::NotAuthorized)
        ));

        // Malformed frames are rejected outright.
        assert!(matches!(
            client.call_session(&unknown, b"garbage".to_vec()).await,
            Err(KeyManagerError::InvalidArgument)
        ));
    }
}
