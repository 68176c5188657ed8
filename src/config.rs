use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use url::Url;

/// Minimum length of the session signing secret (bytes)
pub const MIN_SESSION_SECRET_LEN: usize = 64;

/// Path of the callback route, appended to the public URL
pub const CALLBACK_PATH: &str = "/auth/callback";

/// Sign-in entry point the access gate redirects to
pub const SIGN_IN_PATH: &str = "/auth/signin";

/// Fixed, read-only scopes requested at sign-in
pub const DEFAULT_SCOPES: &[&str] = &[
    // OpenID Connect basics
    "openid",
    "email",
    "profile",
    // User information
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    // Directory
    "https://www.googleapis.com/auth/admin.directory.group.readonly",
    "https://www.googleapis.com/auth/admin.directory.user.readonly",
    "https://www.googleapis.com/auth/directory.readonly",
    // Drive
    "https://www.googleapis.com/auth/drive.readonly",
    // Calendar
    "https://www.googleapis.com/auth/calendar.events.readonly",
    "https://www.googleapis.com/auth/calendar.readonly",
    // Contacts
    "https://www.googleapis.com/auth/contacts.readonly",
    "https://www.googleapis.com/auth/contacts.other.readonly",
    // Cloud Identity groups
    "https://www.googleapis.com/auth/cloud-identity.groups.readonly",
];

/// Suite Gateway - delegated access with stateless sessions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "3000")]
    pub port: u16,

    /// Public base URL of this service (used to build the callback URL)
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// OAuth2 client ID issued by the identity provider
    #[arg(long, env = "OAUTH_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth2 client secret issued by the identity provider
    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Secret used to encrypt session cookies (at least 64 bytes)
    #[arg(long, env = "SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,

    /// Session lifetime in days
    #[arg(long, env = "SESSION_MAX_AGE_DAYS", default_value = "30")]
    pub session_max_age_days: i64,

    /// Comma separated path prefixes that require a session
    #[arg(long, env = "PROTECTED_PATHS", default_value = "/dashboard")]
    pub protected_paths: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Refresh exchange timeout in seconds
    #[arg(long, env = "REFRESH_TIMEOUT_SECS", default_value = "10")]
    pub refresh_timeout: u64,

    /// HTTP connect timeout in seconds for provider and downstream calls
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds for downstream API calls
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,
}

/// Identity provider endpoints and application credentials.
///
/// Read-only, process-wide. Passed explicitly to the refresh engine, the
/// sign-in client and the downstream client factory.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: Url,
    pub token_url: Url,
    pub userinfo_url: Url,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
}

/// Path prefixes guarded by the access gate
#[derive(Clone, Debug, PartialEq)]
pub struct ProtectedPaths {
    prefixes: Vec<String>,
}

impl ProtectedPaths {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = prefixes
            .into_iter()
            .map(|p| p.as_ref().trim().trim_end_matches("/*").trim_end_matches('/').to_string())
            .filter(|p| p.starts_with('/') && p.len() > 1)
            .collect();
        Self { prefixes }
    }

    /// `/dashboard` matches `/dashboard` and `/dashboard/...` but not `/dashboards`
    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Identity provider
    pub provider: ProviderSettings,

    // Session
    pub session_secret: String,
    pub session_max_age_days: i64,
    pub secure_cookies: bool,
    pub protected_paths: ProtectedPaths,

    // Timeouts
    pub refresh_timeout: u64,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();

        let public_url = args
            .public_url
            .context("PUBLIC_URL is required (use --public-url or set PUBLIC_URL env var)")?;

        let provider = ProviderSettings {
            client_id: args
                .client_id
                .context("OAUTH_CLIENT_ID is required (use --client-id or set OAUTH_CLIENT_ID)")?,
            client_secret: args.client_secret.context(
                "OAUTH_CLIENT_SECRET is required (use --client-secret or set OAUTH_CLIENT_SECRET)",
            )?,
            auth_url: env_url(
                "OAUTH_AUTH_URL",
                "https://accounts.google.com/o/oauth2/v2/auth",
            )?,
            token_url: env_url("OAUTH_TOKEN_URL", "https://oauth2.googleapis.com/token")?,
            userinfo_url: env_url(
                "OAUTH_USERINFO_URL",
                "https://openidconnect.googleapis.com/v1/userinfo",
            )?,
            redirect_uri: callback_url(&public_url)?,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        };

        let config = Config {
            server_host: args.host,
            server_port: args.port,

            provider,

            session_secret: args
                .session_secret
                .context("SESSION_SECRET is required (use --session-secret or set SESSION_SECRET)")?,
            session_max_age_days: args.session_max_age_days,
            secure_cookies: parse_bool(&std::env::var("SECURE_COOKIES").unwrap_or_default(), true),
            protected_paths: ProtectedPaths::new(args.protected_paths.split(',')),

            refresh_timeout: args.refresh_timeout,
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.provider.client_id.trim().is_empty() {
            anyhow::bail!("OAUTH_CLIENT_ID must not be empty");
        }

        if self.provider.client_secret.trim().is_empty() {
            anyhow::bail!("OAUTH_CLIENT_SECRET must not be empty");
        }

        if self.session_secret.len() < MIN_SESSION_SECRET_LEN {
            anyhow::bail!(
                "SESSION_SECRET must be at least {} bytes (got {})",
                MIN_SESSION_SECRET_LEN,
                self.session_secret.len()
            );
        }

        if self.session_max_age_days <= 0 {
            anyhow::bail!(
                "SESSION_MAX_AGE_DAYS must be positive (got {})",
                self.session_max_age_days
            );
        }

        if self.refresh_timeout == 0 {
            anyhow::bail!("REFRESH_TIMEOUT_SECS must be greater than zero");
        }

        Ok(())
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout)
    }

    pub fn session_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.session_max_age_days)
    }
}

/// Read a URL from the environment, falling back to a default
fn env_url(var: &str, default: &str) -> Result<Url> {
    let raw = std::env::var(var).unwrap_or_else(|_| default.to_string());
    Url::parse(&raw).with_context(|| format!("{} is not a valid URL: {}", var, raw))
}

/// Build the OAuth callback URL from the public base URL
fn callback_url(public_url: &str) -> Result<Url> {
    let base = public_url.trim_end_matches('/');
    let raw = format!("{}{}", base, CALLBACK_PATH);
    Url::parse(&raw).with_context(|| format!("PUBLIC_URL is not a valid URL: {}", public_url))
}

/// Parse a boolean flag, accepting the usual spellings
fn parse_bool(s: &str, default: bool) -> bool {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
