mod server;

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use base64::Engine;
use clap::{Parser, Subcommand};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
use rand::RngCore;
use rand::rngs::OsRng;
use resonance_api::{DEFAULT_AUTHORITY, Identity, IssuedVia};
use resonance_auth::{Argon2Hasher, TokenAlgorithm, codec};
use resonance_connectors::EnvSecretStore;
use resonance_core::{
    AuthSettings, CONFIG_FILE, apply_env_overrides, default_config_dir, load_settings_from_dir,
    validate_settings, write_default_config_file,
};
use resonance_runtime::AuthRuntime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "resonance", about = "Resonance authentication service")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write an annotated auth.toml into the config dir
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the configuration, then build the runtime once
    Check,
    /// Generate signing material
    Keygen {
        /// HS256, HS384, HS512 or EdDSA
        #[arg(long, default_value = "HS256")]
        algorithm: String,
        /// Emit the HMAC secret as `hex:` instead of `base64:`
        #[arg(long)]
        hex: bool,
        /// Directory for EdDSA key files. Defaults to the config dir
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    /// Password hashing
    Password {
        #[command(subcommand)]
        command: PasswordCommands,
    },
    /// Issue or inspect tokens with the configured keys
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
    /// Run the HTTP surface
    Serve {
        /// Overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum PasswordCommands {
    /// Prompt for a password and print its PHC hash
    Hash,
}

#[derive(Debug, Subcommand)]
enum TokenCommands {
    /// Issue an access/refresh pair for a subject
    Issue {
        #[arg(long)]
        subject: String,
        #[arg(long = "authority")]
        authorities: Vec<String>,
    },
    /// Verify a token and print its claims
    Verify { token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);

    match cli.command {
        Commands::Init { force } => {
            let path = cfg_dir.join(CONFIG_FILE);
            if force && path.exists() {
                fs::remove_file(&path)?;
            }
            let path = write_default_config_file(&cfg_dir)?;
            pout(
                cli.json,
                serde_json::json!({"message": "init complete", "config": path}),
                &format!("Wrote {}", path.display()),
            )?;
        }
        Commands::Check => {
            let settings = load_settings(&cfg_dir)?;
            let runtime = AuthRuntime::from_settings(&settings)?;
            let summary = serde_json::json!({
                "config": cfg_dir.join(CONFIG_FILE),
                "algorithm": runtime.keys().signing().algorithm().as_str(),
                "key_id": runtime.keys().signing().key_id(),
                "access_ttl_secs": runtime.issuer().lifetimes().access.as_secs(),
                "refresh_ttl_secs": runtime.issuer().lifetimes().refresh.as_secs(),
                "oauth2": runtime.oauth2_enabled(),
                "cookie": settings.cookie.enabled,
                "bind": settings.server.bind,
            });
            pout(cli.json, summary, "Configuration OK")?;
        }
        Commands::Keygen {
            algorithm,
            hex,
            out,
            force,
        } => {
            let algorithm: TokenAlgorithm = algorithm.parse()?;
            if algorithm.is_hmac() {
                let secret = generate_hmac_secret(algorithm, hex);
                pout(
                    cli.json,
                    serde_json::json!({"algorithm": algorithm.as_str(), "signing_key": secret}),
                    &secret,
                )?;
            } else {
                let dir = out.unwrap_or_else(|| cfg_dir.clone());
                let (private, public) = write_ed25519_pair(&dir, force)?;
                pout(
                    cli.json,
                    serde_json::json!({
                        "algorithm": algorithm.as_str(),
                        "private_key_path": private,
                        "public_key_path": public,
                    }),
                    &format!(
                        "Wrote {} and {}\nSet tokens.private_key_path and tokens.public_key_path in {CONFIG_FILE}",
                        private.display(),
                        public.display()
                    ),
                )?;
            }
        }
        Commands::Password { command } => match command {
            PasswordCommands::Hash => {
                let hasher = match load_settings(&cfg_dir) {
                    Ok(settings) => Argon2Hasher::new(settings.password.cost())?,
                    Err(_) => Argon2Hasher::default(),
                };
                let password = rpassword::prompt_password("Password: ")?;
                let again = rpassword::prompt_password("Repeat password: ")?;
                if password != again {
                    bail!("passwords do not match");
                }
                let phc = hasher.hash_async(&password).await?;
                pout(cli.json, serde_json::json!({"hash": phc}), &phc)?;
            }
        },
        Commands::Token { command } => {
            let settings = load_settings(&cfg_dir)?;
            let runtime = AuthRuntime::from_settings(&settings)?;
            match command {
                TokenCommands::Issue {
                    subject,
                    authorities,
                } => {
                    let authorities = if authorities.is_empty() {
                        vec![DEFAULT_AUTHORITY.to_string()]
                    } else {
                        authorities
                    };
                    let pair = runtime
                        .issuer()
                        .issue(&Identity::new(subject, authorities, IssuedVia::Local))?;
                    let text = format!(
                        "access:  {}\nrefresh: {}",
                        pair.access_token, pair.refresh_token
                    );
                    pout(cli.json, serde_json::to_value(&pair)?, &text)?;
                }
                TokenCommands::Verify { token } => {
                    let claims = codec::verify(token.trim(), runtime.keys().verification())
                        .with_context(|| "token rejected")?;
                    let text = format!(
                        "{} token for {} ({} authorities), expires at {}",
                        claims.token_type,
                        claims.subject,
                        claims.authorities.len(),
                        claims.expires_at
                    );
                    pout(cli.json, serde_json::to_value(&claims)?, &text)?;
                }
            }
        }
        Commands::Serve { bind } => {
            let settings = load_settings(&cfg_dir)?;
            serve(settings, bind).await?;
        }
    }

    Ok(())
}

/// Config file, then environment overrides, then validation.
fn load_settings(cfg_dir: &Path) -> anyhow::Result<AuthSettings> {
    let mut settings = load_settings_from_dir(cfg_dir)
        .with_context(|| format!("run `resonance init` to create {}", cfg_dir.join(CONFIG_FILE).display()))?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    validate_settings(&settings)?;
    Ok(settings)
}

async fn serve(settings: AuthSettings, bind: Option<String>) -> anyhow::Result<()> {
    let runtime = Arc::new(AuthRuntime::from_settings(&settings)?);
    if let Some(admin) = runtime.bootstrap_admin(&settings, &EnvSecretStore).await? {
        tracing::info!(subject = %admin.subject_id(), "administrator ready");
    }
    let pruner = runtime.spawn_pruner();

    let app = server::router(runtime);
    let addr = bind.unwrap_or(settings.server.bind);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "resonance listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    pruner.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutting down");
}

fn generate_hmac_secret(algorithm: TokenAlgorithm, as_hex: bool) -> String {
    let len = match algorithm {
        TokenAlgorithm::Hs384 => 48,
        TokenAlgorithm::Hs512 => 64,
        _ => 32,
    };
    let mut secret = vec![0u8; len];
    OsRng.fill_bytes(&mut secret);
    if as_hex {
        format!("hex:{}", hex::encode(&secret))
    } else {
        format!(
            "base64:{}",
            base64::engine::general_purpose::STANDARD.encode(&secret)
        )
    }
}

fn write_ed25519_pair(dir: &Path, force: bool) -> anyhow::Result<(PathBuf, PathBuf)> {
    let private = dir.join("signing.pem");
    let public = dir.join("signing.pub.pem");
    if !force && (private.exists() || public.exists()) {
        bail!(
            "{} already exists, pass --force to replace it",
            private.display()
        );
    }

    let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
    let private_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("failed to encode private key: {e}"))?;
    let public_pem = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("failed to encode public key: {e}"))?;

    fs::create_dir_all(dir)?;
    fs::write(&private, private_pem.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&private, fs::Permissions::from_mode(0o600))?;
    }
    fs::write(&public, public_pem.as_bytes())?;
    Ok((private, public))
}

pub fn pout(json_mode: bool, value: serde_json::Value, text: &str) -> anyhow::Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}
