//! Login and ACL decisions.
//!
//! [`Authentication`] chains the password-file [`CredentialStore`] with an
//! optional external policy provider. The provider is modeled as a trait
//! rather than a shared-object ABI; the lifecycle and return-code contract
//! mirror version 2 of the mosquitto auth plugin interface, so a provider
//! wrapping such a plugin maps one to one.
//!
//! A failed `security_init` during reload leaves authentication in a
//! fail-closed state: every subsequent check reports an error (and so a
//! denial) until a reload succeeds.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::credentials::CredentialStore;
use crate::error::{MqttError, Result};
use crate::types::{AclAccess, AuthResult};

/// The only provider contract version this core speaks.
pub const SUPPORTED_PROVIDER_VERSION: i32 = 2;

/// Flat key/value options handed to the provider, from configuration.
pub type AuthOpts = Vec<(String, String)>;

/// An external authentication/authorization policy provider.
///
/// All calls return an integer code: `0` success, `1` denied, anything
/// else an error. `init` is for the provider's own memory; loading users
/// and ACL tables belongs in `security_init`, which is also what a reload
/// re-runs.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn provider_version(&self) -> i32;

    async fn init(&self, opts: &AuthOpts) -> i32;
    async fn cleanup(&self, opts: &AuthOpts) -> i32;

    async fn security_init(&self, opts: &AuthOpts, reloading: bool) -> i32;
    async fn security_cleanup(&self, opts: &AuthOpts, reloading: bool) -> i32;

    async fn acl_check(&self, client_id: &str, username: &str, topic: &str, access: AclAccess)
        -> i32;
    async fn unpwd_check(&self, username: &str, password: &str) -> i32;

    /// TLS-PSK lookup. Part of the contract; unused by this core.
    async fn psk_key_get(&self, _identity: &str, _hint: &str) -> i32 {
        1
    }
}

pub struct Authentication {
    credentials: CredentialStore,
    provider: Option<Box<dyn AuthProvider>>,
    opts: AuthOpts,
    serialize_init: bool,
    serialize_checks: bool,
    init_lock: Mutex<()>,
    checks_lock: Mutex<()>,
    initialized: AtomicBool,
    quitting: AtomicBool,
}

impl Authentication {
    pub fn new(
        credentials: CredentialStore,
        opts: AuthOpts,
        serialize_init: bool,
        serialize_checks: bool,
    ) -> Authentication {
        Authentication {
            credentials,
            provider: None,
            opts,
            serialize_init,
            serialize_checks,
            init_lock: Mutex::new(()),
            checks_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
        }
    }

    /// Installs the external provider. Rejecting an unsupported contract
    /// version is fatal: the broker must not start half-authenticated.
    pub fn with_provider(mut self, provider: Box<dyn AuthProvider>) -> Result<Self> {
        let version = provider.provider_version();
        if version != SUPPORTED_PROVIDER_VERSION {
            return Err(MqttError::Fatal(format!(
                "only auth provider version {SUPPORTED_PROVIDER_VERSION} is supported, provider reports {version}"
            )));
        }
        log::info!("auth provider loaded, contract version {version}");
        self.provider = Some(provider);
        Ok(self)
    }

    #[inline]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    #[inline]
    pub fn set_quitting(&self) {
        self.quitting.store(true, Ordering::SeqCst);
    }

    #[inline]
    fn quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    #[inline]
    fn provider_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn init_guard(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.serialize_init {
            Some(self.init_lock.lock().await)
        } else {
            None
        }
    }

    async fn checks_guard(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.serialize_checks {
            Some(self.checks_lock.lock().await)
        } else {
            None
        }
    }

    /// Provider memory setup. Startup only; an error here is fatal.
    pub async fn init(&self) -> Result<()> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };
        let _guard = self.init_guard().await;
        if self.quitting() {
            return Ok(());
        }
        if provider.init(&self.opts).await != 0 {
            return Err(MqttError::Fatal("error initialising auth provider".into()));
        }
        Ok(())
    }

    /// Loads the provider's security data (users, ACL tables).
    pub async fn security_init(&self, reloading: bool) -> Result<()> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };
        let _guard = self.init_guard().await;
        if self.quitting() {
            return Ok(());
        }
        if provider.security_init(&self.opts, reloading).await != 0 {
            return Err(MqttError::AuthProvider(
                "provider security_init returned an error; if it didn't log anything, we don't know what it was".into(),
            ));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn security_cleanup(&self, reloading: bool) -> Result<()> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };
        self.initialized.store(false, Ordering::SeqCst);
        if provider.security_cleanup(&self.opts, reloading).await != 0 {
            return Err(MqttError::AuthProvider(
                "provider security_cleanup returned an error".into(),
            ));
        }
        Ok(())
    }

    /// Full teardown at shutdown. Errors are logged, not raised.
    pub async fn cleanup(&self) {
        let Some(provider) = &self.provider else {
            return;
        };
        if let Err(e) = self.security_cleanup(false).await {
            log::error!("{e}");
        }
        if provider.cleanup(&self.opts).await != 0 {
            log::error!("error cleaning up auth provider");
        }
    }

    /// Re-runs the provider's security lifecycle. On failure the broker
    /// keeps running but auth checks fail closed until a reload succeeds.
    pub async fn reload(&self) {
        if self.provider.is_none() {
            return;
        }
        let result = async {
            self.security_cleanup(true).await?;
            self.security_init(true).await
        }
        .await;
        if let Err(e) = result {
            log::error!(
                "error reloading auth provider: {e}; security checks will now fail, because we don't know the status of the provider anymore"
            );
            self.initialized.store(false, Ordering::SeqCst);
        }
    }

    /// Re-stats and reloads the password file if it changed on disk.
    pub fn reload_credentials(&self) -> Result<bool> {
        self.credentials.load_if_changed()
    }

    /// The credential store decides first; only on success is the provider
    /// consulted, and its verdict is final.
    pub async fn login(&self, username: &str, password: &str) -> AuthResult {
        let first = self.credentials.check(username, password);
        if !first.success() {
            return first;
        }

        let Some(provider) = &self.provider else {
            return first;
        };
        if !self.provider_initialized() {
            log::error!(
                "username+password check with provider wanted, but initialization failed, can't perform check"
            );
            return AuthResult::Error;
        }

        let _guard = self.checks_guard().await;
        let result = AuthResult::from_login_code(provider.unpwd_check(username, password).await);
        if result == AuthResult::Error {
            log::error!("username+password check by provider returned error for user '{username}'");
        }
        result
    }

    /// Per-topic authorization. Without a provider the default is allow;
    /// with a broken provider every check errors out (fail closed).
    pub async fn acl_check(
        &self,
        client_id: &str,
        username: &str,
        topic: &str,
        access: AclAccess,
    ) -> AuthResult {
        let Some(provider) = &self.provider else {
            return AuthResult::Success;
        };
        if !self.provider_initialized() {
            log::error!("ACL check wanted, but initialization failed, can't perform check");
            return AuthResult::Error;
        }

        let _guard = self.checks_guard().await;
        let result =
            AuthResult::from_acl_code(provider.acl_check(client_id, username, topic, access).await);
        if result == AuthResult::Error {
            log::error!("ACL check by provider returned error for topic '{topic}'");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    /// A provider whose return codes are fixed at construction. A separate
    /// code applies to `security_init` calls with `reloading == true`, to
    /// exercise the fail-closed reload path.
    #[derive(Default)]
    struct TestProvider {
        version: i32,
        init_rc: i32,
        security_init_rc: i32,
        security_init_reload_rc: i32,
        unpwd_rc: i32,
        acl_rc: i32,
        unpwd_calls: AtomicI32,
    }

    impl TestProvider {
        fn v2() -> Self {
            Self { version: 2, ..Default::default() }
        }
    }

    #[async_trait]
    impl AuthProvider for TestProvider {
        fn provider_version(&self) -> i32 {
            self.version
        }
        async fn init(&self, _opts: &AuthOpts) -> i32 {
            self.init_rc
        }
        async fn cleanup(&self, _opts: &AuthOpts) -> i32 {
            0
        }
        async fn security_init(&self, _opts: &AuthOpts, reloading: bool) -> i32 {
            if reloading {
                self.security_init_reload_rc
            } else {
                self.security_init_rc
            }
        }
        async fn security_cleanup(&self, _opts: &AuthOpts, _reloading: bool) -> i32 {
            0
        }
        async fn acl_check(&self, _c: &str, _u: &str, _t: &str, _a: AclAccess) -> i32 {
            self.acl_rc
        }
        async fn unpwd_check(&self, _u: &str, _p: &str) -> i32 {
            self.unpwd_calls.fetch_add(1, Ordering::SeqCst);
            self.unpwd_rc
        }
    }

    fn open_credentials() -> CredentialStore {
        CredentialStore::new(None, false)
    }

    fn auth_with(provider: TestProvider) -> Authentication {
        Authentication::new(open_credentials(), Vec::new(), false, false)
            .with_provider(Box::new(provider))
            .unwrap()
    }

    #[test]
    fn unsupported_version_is_fatal() {
        let provider = TestProvider { version: 3, ..Default::default() };
        let err = Authentication::new(open_credentials(), Vec::new(), false, false)
            .with_provider(Box::new(provider))
            .err()
            .unwrap();
        assert!(matches!(err, MqttError::Fatal(_)));
    }

    #[tokio::test]
    async fn no_auth_configured_allows_everything() {
        let auth = Authentication::new(open_credentials(), Vec::new(), false, false);
        assert_eq!(auth.login("anyone", "x").await, AuthResult::Success);
        assert_eq!(auth.acl_check("c", "u", "t", AclAccess::Write).await, AuthResult::Success);
    }

    #[tokio::test]
    async fn provider_decides_after_credentials_pass() {
        let auth = auth_with(TestProvider::v2());
        auth.init().await.unwrap();
        auth.security_init(false).await.unwrap();
        assert_eq!(auth.login("u", "p").await, AuthResult::Success);

        let auth = auth_with(TestProvider { unpwd_rc: 1, ..TestProvider::v2() });
        auth.security_init(false).await.unwrap();
        assert_eq!(auth.login("u", "p").await, AuthResult::LoginDenied);

        let auth = auth_with(TestProvider { unpwd_rc: -3, ..TestProvider::v2() });
        auth.security_init(false).await.unwrap();
        assert_eq!(auth.login("u", "p").await, AuthResult::Error);
    }

    #[tokio::test]
    async fn credential_denial_is_final() {
        // A configured-but-unloaded password file denies; the provider must
        // not even be consulted.
        let credentials = CredentialStore::new(Some("/nonexistent/pw".into()), false);
        let provider = TestProvider::v2();
        let auth = Authentication::new(credentials, Vec::new(), false, false)
            .with_provider(Box::new(provider))
            .unwrap();
        auth.security_init(false).await.unwrap();

        assert_eq!(auth.login("u", "p").await, AuthResult::LoginDenied);
    }

    #[tokio::test]
    async fn acl_codes_map() {
        let auth = auth_with(TestProvider { acl_rc: 1, ..TestProvider::v2() });
        auth.security_init(false).await.unwrap();
        assert_eq!(auth.acl_check("c", "u", "t", AclAccess::Subscribe).await, AuthResult::AclDenied);
    }

    #[tokio::test]
    async fn uninitialized_provider_fails_checks() {
        let auth = auth_with(TestProvider { security_init_rc: 5, ..TestProvider::v2() });
        auth.security_init(false).await.err().unwrap();
        assert_eq!(auth.acl_check("c", "u", "t", AclAccess::Read).await, AuthResult::Error);
        assert_eq!(auth.login("u", "p").await, AuthResult::Error);
    }

    #[tokio::test]
    async fn reload_failure_fails_closed_until_next_success() {
        let auth = auth_with(TestProvider { security_init_reload_rc: 1, ..TestProvider::v2() });
        auth.security_init(false).await.unwrap();
        assert!(auth.provider_initialized());
        assert_eq!(auth.acl_check("c", "u", "t", AclAccess::Write).await, AuthResult::Success);

        auth.reload().await;
        assert!(!auth.provider_initialized());
        assert_eq!(auth.acl_check("c", "u", "t", AclAccess::Write).await, AuthResult::Error);

        // A later successful (non-reload) security_init recovers.
        auth.security_init(false).await.unwrap();
        assert_eq!(auth.acl_check("c", "u", "t", AclAccess::Write).await, AuthResult::Success);
    }

    #[tokio::test]
    async fn quitting_short_circuits_init() {
        let auth = auth_with(TestProvider { init_rc: 9, security_init_rc: 9, ..TestProvider::v2() });
        auth.set_quitting();

        // Both become no-ops after the quitting flag is set.
        assert!(auth.init().await.is_ok());
        assert!(auth.security_init(false).await.is_ok());
        assert!(!auth.provider_initialized());
    }

    #[tokio::test]
    async fn serialized_checks_still_answer() {
        let provider = TestProvider::v2();
        let auth = Authentication::new(open_credentials(), Vec::new(), true, true)
            .with_provider(Box::new(provider))
            .unwrap();
        auth.init().await.unwrap();
        auth.security_init(false).await.unwrap();
        assert_eq!(auth.acl_check("c", "u", "t", AclAccess::Write).await, AuthResult::Success);
        assert_eq!(auth.login("u", "p").await, AuthResult::Success);
    }
}
