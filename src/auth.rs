//! Credential sources: connection-string parsing, shared-access-signature
//! generation, and the provider interface the transport reads its identity
//! and tokens from.

use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AuthError;

/// Default lifetime of a generated SAS token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

pub type TokenUpdateCallback = Box<dyn Fn() + Send + Sync>;

/// Identity and credentials for one hub connection.
///
/// The transport reads the identity once at construction and asks for the
/// current SAS token on every connect and reconnect. A provider that rotates
/// its tokens announces each rotation through the registered callback.
pub trait AuthProvider: Send + Sync {
    fn device_id(&self) -> String;

    fn module_id(&self) -> Option<String> {
        None
    }

    fn hostname(&self) -> String;

    fn gateway_hostname(&self) -> Option<String> {
        None
    }

    fn ca_cert(&self) -> Option<Vec<u8>> {
        None
    }

    fn current_sas_token(&self) -> Result<String, AuthError>;

    /// Install the callback fired whenever the token rotates. Called once by
    /// the transport during construction.
    fn set_token_update_callback(&self, callback: TokenUpdateCallback);
}

/// Sign `resource_uri` into a `SharedAccessSignature` string valid until
/// `expiry_unix`.
pub(crate) fn generate_sas_token(
    resource_uri: &str,
    key_base64: &str,
    expiry_unix: i64,
) -> Result<String, AuthError> {
    let encoded_uri = urlencoding::encode(resource_uri);
    let to_sign = format!("{encoded_uri}\n{expiry_unix}");

    let key = BASE64
        .decode(key_base64)
        .map_err(|e| AuthError::InvalidKey(format!("key is not valid base64: {e}")))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .expect("HMAC accepts keys of any length");
    mac.update(to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry_unix}",
        urlencoding::encode(&signature)
    ))
}

/// Parsed `HostName=…;DeviceId=…;SharedAccessKey=…` connection string.
#[derive(Debug, Clone, Default)]
struct ConnectionString {
    host_name: String,
    device_id: String,
    module_id: Option<String>,
    gateway_host_name: Option<String>,
    shared_access_key: Option<String>,
    shared_access_signature: Option<String>,
}

impl ConnectionString {
    fn parse(connection_string: &str) -> Result<Self, AuthError> {
        let mut parsed = ConnectionString::default();

        for part in connection_string.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                AuthError::MalformedConnectionString(format!("segment {part:?} has no value"))
            })?;
            if value.is_empty() {
                return Err(AuthError::MalformedConnectionString(format!(
                    "segment {key:?} has an empty value"
                )));
            }
            match key {
                "HostName" => parsed.host_name = value.to_owned(),
                "DeviceId" => parsed.device_id = value.to_owned(),
                "ModuleId" => parsed.module_id = Some(value.to_owned()),
                "GatewayHostName" => parsed.gateway_host_name = Some(value.to_owned()),
                "SharedAccessKey" => parsed.shared_access_key = Some(value.to_owned()),
                "SharedAccessSignature" => {
                    parsed.shared_access_signature = Some(value.to_owned())
                }
                other => log::debug!("ignoring connection string segment {other:?}"),
            }
        }

        if parsed.host_name.is_empty() {
            return Err(AuthError::MalformedConnectionString(
                "HostName is required".into(),
            ));
        }
        if parsed.device_id.is_empty() {
            return Err(AuthError::MalformedConnectionString(
                "DeviceId is required".into(),
            ));
        }
        if parsed.shared_access_key.is_none() && parsed.shared_access_signature.is_none() {
            return Err(AuthError::MalformedConnectionString(
                "either SharedAccessKey or SharedAccessSignature is required".into(),
            ));
        }

        Ok(parsed)
    }
}

/// Symmetric-key credentials for a device or module, usually built from a
/// connection string.
pub struct SymmetricKeyAuth {
    connection: ConnectionString,
    ca_cert: Option<Vec<u8>>,
    token_ttl: Duration,
    token_update_callback: Mutex<Option<TokenUpdateCallback>>,
}

impl SymmetricKeyAuth {
    pub fn from_connection_string(connection_string: &str) -> Result<Self, AuthError> {
        Ok(SymmetricKeyAuth {
            connection: ConnectionString::parse(connection_string)?,
            ca_cert: None,
            token_ttl: DEFAULT_TOKEN_TTL,
            token_update_callback: Mutex::new(None),
        })
    }

    /// Trust `ca_cert` (PEM) when connecting, typically the certificate of
    /// an edge gateway.
    pub fn with_ca_cert(mut self, ca_cert: Vec<u8>) -> Self {
        self.ca_cert = Some(ca_cert);
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Announce a credential rotation. The transport reacts by tearing the
    /// session down and reconnecting with a freshly generated token.
    pub fn renew_token(&self) {
        let callback = self
            .token_update_callback
            .lock()
            .expect("token callback lock poisoned");
        match callback.as_ref() {
            Some(callback) => callback(),
            None => log::debug!("token renewed before any transport was attached"),
        }
    }

    fn resource_uri(&self) -> String {
        let mut uri = format!("{}/devices/{}", self.connection.host_name, self.connection.device_id);
        if let Some(module_id) = &self.connection.module_id {
            uri = format!("{uri}/modules/{module_id}");
        }
        uri
    }
}

impl AuthProvider for SymmetricKeyAuth {
    fn device_id(&self) -> String {
        self.connection.device_id.clone()
    }

    fn module_id(&self) -> Option<String> {
        self.connection.module_id.clone()
    }

    fn hostname(&self) -> String {
        self.connection.host_name.clone()
    }

    fn gateway_hostname(&self) -> Option<String> {
        self.connection.gateway_host_name.clone()
    }

    fn ca_cert(&self) -> Option<Vec<u8>> {
        self.ca_cert.clone()
    }

    fn current_sas_token(&self) -> Result<String, AuthError> {
        if let Some(signature) = &self.connection.shared_access_signature {
            return Ok(signature.clone());
        }
        let key = self
            .connection
            .shared_access_key
            .as_ref()
            .expect("validated at parse time: key or signature is present");
        let expiry = chrono::Utc::now().timestamp() + self.token_ttl.as_secs() as i64;
        generate_sas_token(&self.resource_uri(), key, expiry)
    }

    fn set_token_update_callback(&self, callback: TokenUpdateCallback) {
        let mut slot = self
            .token_update_callback
            .lock()
            .expect("token callback lock poisoned");
        *slot = Some(callback);
    }
}

/// Symmetric-key credentials for the provisioning handshake: the device is
/// known to the provisioning service by registration id within an id scope.
pub struct SymmetricKeySecurityClient {
    registration_id: String,
    symmetric_key: String,
    id_scope: String,
    token_ttl: Duration,
}

impl SymmetricKeySecurityClient {
    pub fn new(
        registration_id: impl Into<String>,
        symmetric_key: impl Into<String>,
        id_scope: impl Into<String>,
    ) -> Self {
        SymmetricKeySecurityClient {
            registration_id: registration_id.into(),
            symmetric_key: symmetric_key.into(),
            id_scope: id_scope.into(),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    pub fn id_scope(&self) -> &str {
        &self.id_scope
    }

    pub fn current_sas_token(&self) -> Result<String, AuthError> {
        let resource_uri = format!("{}/registrations/{}", self.id_scope, self.registration_id);
        let expiry = chrono::Utc::now().timestamp() + self.token_ttl.as_secs() as i64;
        generate_sas_token(&resource_uri, &self.symmetric_key, expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_connection_string() {
        let auth = SymmetricKeyAuth::from_connection_string(
            "HostName=hub.azure-devices.net;DeviceId=d1;SharedAccessKey=c2VjcmV0",
        )
        .unwrap();
        assert_eq!(auth.device_id(), "d1");
        assert_eq!(auth.hostname(), "hub.azure-devices.net");
        assert_eq!(auth.module_id(), None);
        assert_eq!(auth.gateway_hostname(), None);
    }

    #[test]
    fn parses_module_connection_string_with_gateway() {
        let auth = SymmetricKeyAuth::from_connection_string(
            "HostName=h;DeviceId=d;ModuleId=m;SharedAccessKey=c2VjcmV0;GatewayHostName=edge",
        )
        .unwrap();
        assert_eq!(auth.module_id().as_deref(), Some("m"));
        assert_eq!(auth.gateway_hostname().as_deref(), Some("edge"));
    }

    #[test]
    fn rejects_connection_string_without_credentials() {
        let result = SymmetricKeyAuth::from_connection_string("HostName=h;DeviceId=d");
        assert!(matches!(result, Err(AuthError::MalformedConnectionString(_))));
    }

    #[test]
    fn rejects_segment_without_value() {
        let result =
            SymmetricKeyAuth::from_connection_string("HostName=h;DeviceId;SharedAccessKey=a2V5");
        assert!(matches!(result, Err(AuthError::MalformedConnectionString(_))));
    }

    #[test]
    fn fixed_signature_is_returned_verbatim() {
        let auth = SymmetricKeyAuth::from_connection_string(
            "HostName=h;DeviceId=d;SharedAccessSignature=SharedAccessSignature sr=h&sig=s&se=1",
        )
        .unwrap();
        assert_eq!(
            auth.current_sas_token().unwrap(),
            "SharedAccessSignature sr=h&sig=s&se=1"
        );
    }

    #[test]
    fn generated_token_has_expected_shape() {
        let token = generate_sas_token("hub/devices/d1", "c2VjcmV0a2V5", 1_700_000_000).unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=hub%2Fdevices%2Fd1&sig="));
        assert!(token.ends_with("&se=1700000000"));
    }

    #[test]
    fn generated_token_rejects_bad_key() {
        assert!(matches!(
            generate_sas_token("uri", "not base64!!!", 1),
            Err(AuthError::InvalidKey(_))
        ));
    }

    #[test]
    fn renew_fires_registered_callback() {
        let auth = SymmetricKeyAuth::from_connection_string(
            "HostName=h;DeviceId=d;SharedAccessKey=c2VjcmV0",
        )
        .unwrap();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observer = std::sync::Arc::clone(&fired);
        auth.set_token_update_callback(Box::new(move || {
            observer.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        auth.renew_token();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn provisioning_token_covers_registration_uri() {
        let client = SymmetricKeySecurityClient::new("reg-1", "a2V5", "0ne000ABCDE");
        let token = client.current_sas_token().unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=0ne000ABCDE%2Fregistrations%2Freg-1&sig="));
    }
}
