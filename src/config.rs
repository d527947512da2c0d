use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf};

const ENV_PREFIX: &str = "BLOG_TENANCY_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Root/marketing domain tenants are carved out of, e.g. `example.com`.
    pub root_domain: String,
    /// Public base URL of the application, used for local asset URLs and CSP.
    pub app_url: String,
    pub environment: Environment,
    pub storage: StorageConfig,
    pub mail: MailConfig,
    pub rate_limit_fail_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Storage backend, chosen once at startup.
#[derive(Clone)]
pub enum StorageConfig {
    Local {
        upload_dir: PathBuf,
    },
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    },
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageConfig::Local { upload_dir } => f
                .debug_struct("Local")
                .field("upload_dir", upload_dir)
                .finish(),
            StorageConfig::S3 {
                bucket,
                region,
                endpoint,
                ..
            } => f
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("region", region)
                .field("endpoint", endpoint)
                .finish_non_exhaustive(),
        }
    }
}

/// Mail backend, chosen once at startup.
#[derive(Clone)]
pub enum MailConfig {
    Disabled,
    Resend {
        api_key: String,
        from: String,
    },
    Smtp {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        secure: bool,
        from: String,
    },
}

impl std::fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailConfig::Disabled => f.write_str("Disabled"),
            MailConfig::Resend { from, .. } => f
                .debug_struct("Resend")
                .field("from", from)
                .finish_non_exhaustive(),
            MailConfig::Smtp {
                host, port, from, ..
            } => f
                .debug_struct("Smtp")
                .field("host", host)
                .field("port", port)
                .field("from", from)
                .finish_non_exhaustive(),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Multi-tenant blog edge and action service")]
pub struct Args {
    /// Host to bind to (overrides BLOG_TENANCY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BLOG_TENANCY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides BLOG_TENANCY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Root domain tenants live under (overrides BLOG_TENANCY_ROOT_DOMAIN)
    #[arg(long)]
    pub root_domain: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over variables returned by `lookup`.
    /// `lookup` receives full variable names such as `BLOG_TENANCY_PORT`.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let env_host = var("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match var("PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing {ENV_PREFIX}PORT value `{}`", value))?,
            None => 3000,
        };
        let env_db = var("DATABASE_URL").unwrap_or_else(|| "sqlite://./data/blog_tenancy.db".into());
        let env_root = var("ROOT_DOMAIN").unwrap_or_else(|| "localhost:3000".into());

        let app_url = var("APP_URL").unwrap_or_else(|| "http://localhost:3000".into());
        url::Url::parse(&app_url)
            .with_context(|| format!("parsing {ENV_PREFIX}APP_URL value `{}`", app_url))?;

        let environment = match var("ENV").as_deref() {
            None | Some("development") | Some("dev") | Some("test") => Environment::Development,
            Some("production") | Some("prod") => Environment::Production,
            Some(other) => bail!("{ENV_PREFIX}ENV must be `production` or `development`, got `{other}`"),
        };

        let storage = match var("STORAGE_BACKEND").as_deref() {
            None | Some("local") => StorageConfig::Local {
                upload_dir: var("UPLOAD_DIR")
                    .unwrap_or_else(|| "./data/uploads".into())
                    .into(),
            },
            Some("s3") => {
                let required = |name: &str| {
                    var(name).with_context(|| {
                        format!("{ENV_PREFIX}{name} is required when STORAGE_BACKEND=s3")
                    })
                };
                StorageConfig::S3 {
                    bucket: required("S3_BUCKET")?,
                    region: required("S3_REGION")?,
                    endpoint: var("S3_ENDPOINT").map(|e| e.trim_end_matches('/').to_string()),
                    access_key_id: required("S3_ACCESS_KEY_ID")?,
                    secret_access_key: required("S3_SECRET_ACCESS_KEY")?,
                }
            }
            Some(other) => bail!("{ENV_PREFIX}STORAGE_BACKEND must be `local` or `s3`, got `{other}`"),
        };

        let from = var("MAIL_FROM").unwrap_or_else(|| "security@localhost".into());
        let mail = match var("MAIL_BACKEND").as_deref() {
            None | Some("disabled") => MailConfig::Disabled,
            Some("resend") => MailConfig::Resend {
                api_key: var("RESEND_API_KEY").with_context(|| {
                    format!("{ENV_PREFIX}RESEND_API_KEY is required when MAIL_BACKEND=resend")
                })?,
                from,
            },
            Some("smtp") => MailConfig::Smtp {
                host: var("SMTP_HOST").with_context(|| {
                    format!("{ENV_PREFIX}SMTP_HOST is required when MAIL_BACKEND=smtp")
                })?,
                port: match var("SMTP_PORT") {
                    Some(value) => value
                        .parse::<u16>()
                        .with_context(|| format!("parsing {ENV_PREFIX}SMTP_PORT value `{}`", value))?,
                    None => 587,
                },
                username: var("SMTP_USER"),
                password: var("SMTP_PASS"),
                secure: parse_flag(var("SMTP_SECURE")),
                from,
            },
            Some(other) => bail!(
                "{ENV_PREFIX}MAIL_BACKEND must be `resend`, `smtp` or `disabled`, got `{other}`"
            ),
        };

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            root_domain: args.root_domain.unwrap_or(env_root).to_ascii_lowercase(),
            app_url: app_url.trim_end_matches('/').to_string(),
            environment,
            storage,
            mail,
            rate_limit_fail_closed: parse_flag(var("RATE_LIMIT_FAIL_CLOSED")),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_flag(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true") | Some("yes"))
}
