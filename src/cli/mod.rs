//! Command-line interface for Authority
//!
//! `serve` runs the HTTP service; the other commands administer clients,
//! revocations and housekeeping directly against the configured storage.

use crate::Result;
use crate::auth::{ClientSpec, Sweeper};
use crate::config::Config;
use crate::core::Dependencies;
use crate::model::{Client, RevocationReason};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::{Value, json};

/// Parse a comma-separated list from CLI arguments
fn parse_comma_list(matches: &ArgMatches, key: &str) -> Vec<String> {
    matches
        .get_one::<String>(key)
        .map(|s| {
            s.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Main CLI entry point
pub async fn run() -> Result<()> {
    let matches = build_cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| crate::constants::CONFIG_FILE_NAME.to_string());
    let mut config = Config::load_with_env(&config_path)?;

    if let Some(("serve", sub)) = matches.subcommand() {
        return handle_serve_command(sub, &mut config).await;
    }

    let deps = crate::core::create_dependencies(&config).await?;
    match execute(&matches, &deps).await? {
        Some(output) => {
            println!("{}", output);
            Ok(())
        }
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            std::process::exit(1);
        }
    }
}

// ============================================================================
// CLI Building
// ============================================================================

pub fn build_cli() -> Command {
    let json_flag = || {
        Arg::new("json")
            .long("json")
            .action(ArgAction::SetTrue)
            .help("Print machine-readable JSON")
    };

    Command::new("authority")
        .about("Authority - OAuth 2.0 / OpenID Connect identity service")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .help("Path to the configuration file (JSON or YAML)"),
        )
        .subcommand(
            Command::new("serve")
                .about("Start the HTTP service")
                .arg(Arg::new("host").long("host").help("Bind address"))
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_parser(clap::value_parser!(u16))
                        .help("Port to listen on"),
                ),
        )
        .subcommand(
            Command::new("clients")
                .about("Manage OAuth clients")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create")
                        .about("Register a client and print its credentials")
                        .arg(Arg::new("name").long("name").required(true))
                        .arg(
                            Arg::new("redirect-uris")
                                .long("redirect-uris")
                                .required(true)
                                .help("Comma-separated redirect URIs"),
                        )
                        .arg(
                            Arg::new("scopes")
                                .long("scopes")
                                .default_value("openid,profile,email")
                                .help("Comma-separated scopes the client may request"),
                        )
                        .arg(
                            Arg::new("public")
                                .long("public")
                                .action(ArgAction::SetTrue)
                                .help("Public client without a secret (PKCE required)"),
                        )
                        .arg(json_flag()),
                )
                .subcommand(Command::new("list").about("List clients").arg(json_flag()))
                .subcommand(
                    Command::new("deactivate")
                        .about("Deactivate a client")
                        .arg(Arg::new("client-id").required(true).index(1)),
                )
                .subcommand(
                    Command::new("rotate-secret")
                        .about("Issue a new client secret")
                        .arg(Arg::new("client-id").required(true).index(1))
                        .arg(json_flag()),
                ),
        )
        .subcommand(
            Command::new("revoke-user")
                .about("Revoke every token issued to a user")
                .arg(Arg::new("user-id").required(true).index(1))
                .arg(
                    Arg::new("reason")
                        .long("reason")
                        .default_value("manual")
                        .help("logout, password_change, role_change, account_suspended or manual"),
                ),
        )
        .subcommand(
            Command::new("sweep")
                .about("Delete expired codes, sessions and blacklist entries once")
                .arg(json_flag()),
        )
        .subcommand(Command::new("scopes").about("List configured scopes").arg(json_flag()))
}

// ============================================================================
// Command handlers
// ============================================================================

/// Run a non-serve command and return what should be printed
pub async fn execute(matches: &ArgMatches, deps: &Dependencies) -> Result<Option<String>> {
    let output = match matches.subcommand() {
        Some(("clients", sub)) => handle_clients_command(sub, deps).await?,
        Some(("revoke-user", sub)) => {
            let user_id = required(sub, "user-id")?;
            let reason = sub
                .get_one::<String>("reason")
                .map(String::as_str)
                .unwrap_or("manual")
                .parse::<RevocationReason>()
                .map_err(crate::AuthorityError::validation)?;
            deps.revocation.revoke_all_for_user(user_id, reason).await?;
            format!("✅ All tokens of '{}' revoked ({})", user_id, reason)
        }
        Some(("sweep", sub)) => {
            let report = Sweeper::from_dependencies(deps).run_once().await;
            if sub.get_flag("json") {
                serde_json::to_string_pretty(&report)?
            } else {
                let mut out = format!(
                    "Removed {} codes, {} sessions, {} blacklist entries",
                    report.codes, report.sessions, report.blacklist
                );
                for error in &report.errors {
                    out.push_str(&format!("\n  ⚠ {}", error));
                }
                out
            }
        }
        Some(("scopes", sub)) => {
            let definitions = deps.scopes.definitions();
            if sub.get_flag("json") {
                serde_json::to_string_pretty(definitions)?
            } else {
                let mut out = String::from("Scopes:");
                for scope in definitions {
                    out.push_str(&format!(
                        "\n  {:<12} {} [{}]",
                        scope.name,
                        scope.description,
                        scope.services.join(", ")
                    ));
                }
                out
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(output))
}

fn required<'a>(matches: &'a ArgMatches, key: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(key)
        .map(String::as_str)
        .ok_or_else(|| crate::AuthorityError::validation(format!("--{} is required", key)))
}

async fn handle_clients_command(matches: &ArgMatches, deps: &Dependencies) -> Result<String> {
    match matches.subcommand() {
        Some(("create", sub)) => {
            let spec = ClientSpec {
                name: required(sub, "name")?.to_string(),
                redirect_uris: parse_comma_list(sub, "redirect-uris"),
                allowed_scopes: parse_comma_list(sub, "scopes"),
                confidential: !sub.get_flag("public"),
                allow_duplicate_name: false,
            };
            let registered = deps.clients.register(spec).await?;

            if sub.get_flag("json") {
                return Ok(serde_json::to_string_pretty(&json!({
                    "client_id": registered.client.id,
                    "client_secret": registered.client_secret,
                }))?);
            }
            let mut out = format!("\n✅ Client created!\nClient ID:     {}", registered.client.id);
            match registered.client_secret {
                Some(secret) => {
                    out.push_str(&format!("\nClient Secret: {}", secret));
                    out.push_str("\n\nThe secret is shown only once; store it now.");
                }
                None => out.push_str("\nPublic client: use PKCE (S256) when authorizing."),
            }
            Ok(out)
        }
        Some(("list", sub)) => {
            let clients = deps.clients.list().await?;
            if sub.get_flag("json") {
                return Ok(serde_json::to_string_pretty(&clients)?);
            }
            Ok(render_client_list(&clients))
        }
        Some(("deactivate", sub)) => {
            let client_id = required(sub, "client-id")?;
            deps.clients.deactivate(client_id).await?;
            Ok(format!("✅ Client '{}' deactivated", client_id))
        }
        Some(("rotate-secret", sub)) => {
            let client_id = required(sub, "client-id")?;
            let secret = deps.clients.rotate_secret(client_id).await?;
            if sub.get_flag("json") {
                let value: Value = json!({
                    "client_id": client_id,
                    "client_secret": secret,
                });
                return Ok(serde_json::to_string_pretty(&value)?);
            }
            Ok(format!(
                "✅ New secret for '{}': {}\nThe previous secret no longer works.",
                client_id, secret
            ))
        }
        _ => Err(crate::AuthorityError::validation("unknown clients subcommand")),
    }
}

fn render_client_list(clients: &[Client]) -> String {
    if clients.is_empty() {
        return "No clients registered".to_string();
    }
    let mut out = String::from("Clients:");
    for client in clients {
        let kind = if client.is_confidential() { "confidential" } else { "public" };
        let status = if client.active { "" } else { " (inactive)" };
        out.push_str(&format!(
            "\n  {} ({}) {} [{}]{}",
            client.name,
            client.id,
            kind,
            client.allowed_scopes.join(" "),
            status
        ));
    }
    out
}

/// Handle the serve command; flags override the configuration file
async fn handle_serve_command(matches: &ArgMatches, config: &mut Config) -> Result<()> {
    let mut http = config.get_http();
    if let Some(host) = matches.get_one::<String>("host") {
        http.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        http.port = *port;
    }
    config.http = Some(http.clone());

    println!("🚀 Starting Authority on {}:{}", http.host, http.port);
    println!("   Issuer: {}", config.issuer());
    println!("   Press Ctrl+C to stop\n");
    crate::http::start_server(config.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::TestEnvironment;

    async fn run_args(env: &TestEnvironment, args: &[&str]) -> String {
        let matches = build_cli().try_get_matches_from(args).unwrap();
        execute(&matches, &env.deps).await.unwrap().unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[tokio::test]
    async fn test_clients_create_list_and_deactivate() {
        let env = TestEnvironment::new().await;

        let out = run_args(
            &env,
            &[
                "authority",
                "clients",
                "create",
                "--name",
                "Billing",
                "--redirect-uris",
                "https://billing/cb",
                "--scopes",
                "openid,profile",
                "--json",
            ],
        )
        .await;
        let created: Value = serde_json::from_str(&out).unwrap();
        let client_id = created["client_id"].as_str().unwrap().to_string();
        assert!(created["client_secret"].is_string());

        let out = run_args(&env, &["authority", "clients", "list"]).await;
        assert!(out.contains("Billing"));
        assert!(out.contains("confidential"));

        run_args(&env, &["authority", "clients", "deactivate", client_id.as_str()]).await;
        let client = env.deps.clients.find(&client_id).await.unwrap();
        assert!(!client.active);
    }

    #[tokio::test]
    async fn test_public_client_has_no_secret() {
        let env = TestEnvironment::new().await;
        let out = run_args(
            &env,
            &[
                "authority",
                "clients",
                "create",
                "--name",
                "Spa",
                "--redirect-uris",
                "https://spa/cb",
                "--public",
                "--json",
            ],
        )
        .await;
        let created: Value = serde_json::from_str(&out).unwrap();
        assert!(created["client_secret"].is_null());
    }

    #[tokio::test]
    async fn test_revoke_user_rejects_unknown_reason() {
        let env = TestEnvironment::new().await;
        let matches = build_cli()
            .try_get_matches_from(["authority", "revoke-user", "u1", "--reason", "bored"])
            .unwrap();
        assert!(execute(&matches, &env.deps).await.is_err());

        let out = run_args(&env, &["authority", "revoke-user", "u1", "--reason", "password_change"]).await;
        assert!(out.contains("password_change"));
        assert!(env.deps.revocation.is_revoked("any", "u1", None).await);
    }

    #[tokio::test]
    async fn test_sweep_and_scopes() {
        let env = TestEnvironment::new().await;

        let out = run_args(&env, &["authority", "sweep", "--json"]).await;
        let report: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(report["codes"], 0);

        let out = run_args(&env, &["authority", "scopes"]).await;
        assert!(out.contains("openid"));
        assert!(out.contains("admin"));
    }
}
