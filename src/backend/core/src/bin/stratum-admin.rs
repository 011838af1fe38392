//! Stratum Admin - operator command-line interface
//!
//! Talks directly to the database configured for the server: lists and sets
//! up tenants, manages users, checks permissions, and issues or inspects
//! tokens.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use std::sync::Arc;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use stratum_core::{
    auth::{TokenKind, TokenService},
    config::Config,
    db::{default_registry, Database, TenantDirectory, TenantId, TenantName, TenantRouter},
    rbac::{
        AuthorizationService, GroupId, NewUser, PermissionStore, ProtectedGroups, UserDirectory,
        UserId,
    },
    tenancy::TenantBootstrapper,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "stratum-admin",
    version,
    about = "Stratum - tenant, user and token administration",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATUM_CONFIG")]
    config: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Tenant operations
    #[command(subcommand)]
    Tenants(TenantCommands),

    /// User operations
    #[command(subcommand)]
    Users(UserCommands),

    /// Check whether a user holds a permission
    Check {
        /// Tenant name
        tenant: String,
        /// User id
        user_id: i32,
        /// Permission name
        permission: String,
    },

    /// Token operations
    #[command(subcommand)]
    Token(TokenCommands),
}

#[derive(Subcommand)]
enum TenantCommands {
    /// List tenant schemas and their registered ids
    List,

    /// Provision a tenant and seed its system permissions (idempotent)
    Setup {
        /// Tenant name
        name: String,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Create {
        /// Tenant name
        tenant: String,
        username: String,
        email: String,
        /// Initial password
        #[arg(long, env = "STRATUM_ADMIN_PASSWORD")]
        password: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        /// Add the new user to this group id
        #[arg(long)]
        group: Option<i32>,
    },

    /// Add a user to a group
    AddToGroup {
        tenant: String,
        user_id: i32,
        group_id: i32,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue an access/refresh token pair
    Issue {
        /// User id
        #[arg(long)]
        user: i32,
        /// Tenant id
        #[arg(long)]
        tenant: i32,
    },

    /// Validate a token and print its claims
    Inspect {
        token: String,
        /// Treat the token as a refresh token
        #[arg(long)]
        refresh: bool,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Data Types for Output
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Tabled)]
struct TenantRow {
    #[tabled(rename = "Tenant")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Registered")]
    registered_at: String,
}

#[derive(Debug, Serialize, Tabled)]
struct ClaimRow {
    #[tabled(rename = "Claim")]
    claim: String,
    #[tabled(rename = "Value")]
    value: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn print_success(&self, message: &str) {
        if !self.is_json() {
            println!("{} {}", "[OK]".green().bold(), message);
        }
    }

    fn print_error(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                eprintln!("{}", serde_json::json!({ "status": "error", "message": message }));
            }
            OutputFormat::Text => {
                eprintln!("{} {}", "[ERROR]".red().bold(), message);
            }
        }
    }

    fn print_warning(&self, message: &str) {
        if !self.is_json() {
            println!("{} {}", "[WARN]".yellow().bold(), message);
        }
    }

    fn print_table<T: Tabled + Serialize>(&self, items: &[T]) -> Result<()> {
        if self.is_json() {
            return self.print_json(&items);
        }
        if items.is_empty() {
            println!("{}", "No results found.".dimmed());
            return Ok(());
        }
        let table = Table::new(items)
            .with(Style::rounded())
            .with(Modify::new(Columns::first()).with(Alignment::left()))
            .to_string();
        println!("{}", table);
        Ok(())
    }

    fn print_json<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    fn print_key_value(&self, key: &str, value: &str) {
        if !self.is_json() {
            println!("  {}: {}", key.cyan(), value);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Services
// ═══════════════════════════════════════════════════════════════════════════════

struct Services {
    router: TenantRouter,
    directory: TenantDirectory,
    store: Arc<PermissionStore>,
}

impl Services {
    async fn connect(config: &Config) -> Result<Self> {
        let db = Database::connect(&config.database)
            .await
            .context("failed to connect to the database")?;
        let registry = Arc::new(default_registry()?);
        let directory = TenantDirectory::new(db.pool().clone());
        directory.ensure_table().await?;

        Ok(Self {
            router: TenantRouter::new(db.pool().clone(), registry),
            directory,
            store: Arc::new(PermissionStore::new(ProtectedGroups::system())),
        })
    }

    fn bootstrapper(&self) -> TenantBootstrapper {
        TenantBootstrapper::new(self.router.clone(), self.directory.clone(), self.store.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn handle_tenant_command(cmd: TenantCommands, config: &Config, output: &OutputHelper) -> Result<()> {
    let services = Services::connect(config).await?;

    match cmd {
        TenantCommands::List => {
            let namespaces = services.router.list_namespaces().await?;
            let registered = services.directory.list().await?;

            let rows: Vec<TenantRow> = namespaces
                .iter()
                .map(|tenant| {
                    let record = registered.iter().find(|r| r.name == tenant.as_str());
                    TenantRow {
                        name: tenant.to_string(),
                        id: record.map(|r| r.id.to_string()).unwrap_or_else(|| "-".to_string()),
                        registered_at: record
                            .map(|r| r.created_at.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "not set up".to_string()),
                    }
                })
                .collect();
            output.print_table(&rows)
        }
        TenantCommands::Setup { name } => {
            let tenant = TenantName::parse(&name)?;
            let setup = services.bootstrapper().setup(&tenant).await?;
            if output.is_json() {
                return output.print_json(&setup);
            }
            output.print_success(&format!("Tenant {} is set up", tenant));
            output.print_key_value("Tenant ID", &setup.tenant_id.to_string());
            output.print_key_value("Admin group ID", &setup.admin_group.id.to_string());
            output.print_key_value(
                "Admin permissions",
                &setup.admin_group.permission_ids.len().to_string(),
            );
            Ok(())
        }
    }
}

async fn handle_user_command(cmd: UserCommands, config: &Config, output: &OutputHelper) -> Result<()> {
    let services = Services::connect(config).await?;
    let users = UserDirectory::new();

    match cmd {
        UserCommands::Create {
            tenant,
            username,
            email,
            password,
            first_name,
            last_name,
            group,
        } => {
            let tenant = TenantName::parse(&tenant)?;
            let mut conn = services.router.connection_for(&tenant).await?;
            let new_user = NewUser {
                username,
                email,
                password,
                first_name,
                last_name,
            };
            let mut user = users.create_user(&mut conn, &new_user).await?;
            if let Some(group) = group {
                users.add_user_to_group(&mut conn, user.id, GroupId(group)).await?;
                user = users.get_user(&mut conn, user.id).await?;
            }

            if output.is_json() {
                return output.print_json(&user);
            }
            output.print_success(&format!("User {} created", user.username));
            output.print_key_value("User ID", &user.id.to_string());
            output.print_key_value("Status", user.status.as_str());
            Ok(())
        }
        UserCommands::AddToGroup {
            tenant,
            user_id,
            group_id,
        } => {
            let tenant = TenantName::parse(&tenant)?;
            let mut conn = services.router.connection_for(&tenant).await?;
            users
                .add_user_to_group(&mut conn, UserId(user_id), GroupId(group_id))
                .await?;
            output.print_success(&format!("User {} added to group {}", user_id, group_id));
            Ok(())
        }
    }
}

async fn handle_check_command(
    tenant: String,
    user_id: i32,
    permission: String,
    config: &Config,
    output: &OutputHelper,
) -> Result<()> {
    let services = Services::connect(config).await?;
    let tenant = TenantName::parse(&tenant)?;
    let authz = AuthorizationService::new(services.router.clone(), services.store.clone());

    let allowed = authz
        .user_has_permission(&tenant, UserId(user_id), permission.as_str())
        .await?;

    if output.is_json() {
        return output.print_json(&serde_json::json!({
            "tenant": tenant,
            "user_id": user_id,
            "permission": permission,
            "allowed": allowed,
        }));
    }
    if allowed {
        output.print_success(&format!("User {} has {} in {}", user_id, permission, tenant));
    } else {
        output.print_warning(&format!("User {} lacks {} in {}", user_id, permission, tenant));
    }
    Ok(())
}

fn handle_token_command(cmd: TokenCommands, config: &Config, output: &OutputHelper) -> Result<()> {
    let tokens = TokenService::new(&config.jwt)?;

    match cmd {
        TokenCommands::Issue { user, tenant } => {
            let pair = tokens.issue_tokens(UserId(user), TenantId(tenant))?;
            if output.is_json() {
                return output.print_json(&pair);
            }
            output.print_key_value("Access token", &pair.access_token);
            output.print_key_value("Refresh token", &pair.refresh_token);
            output.print_key_value("Expires in", &format!("{}s", pair.expires_in));
            Ok(())
        }
        TokenCommands::Inspect { token, refresh } => {
            let kind = if refresh { TokenKind::Refresh } else { TokenKind::Access };
            let claims = tokens
                .validate(kind, &token)
                .with_context(|| format!("{} token rejected", kind))?;

            if output.is_json() {
                return output.print_json(&claims);
            }
            let rows = vec![
                ClaimRow { claim: "kind".into(), value: kind.to_string() },
                ClaimRow { claim: "userID".into(), value: claims.user_id.to_string() },
                ClaimRow { claim: "tenantID".into(), value: claims.tenant_id.to_string() },
                ClaimRow { claim: "iss".into(), value: claims.iss.clone() },
                ClaimRow { claim: "iat".into(), value: claims.issued_at().to_rfc3339() },
                ClaimRow { claim: "nbf".into(), value: claims.not_before().to_rfc3339() },
                ClaimRow { claim: "exp".into(), value: claims.expires_at().to_rfc3339() },
            ];
            output.print_table(&rows)
        }
    }
}

async fn run(cli: Cli, output: &OutputHelper) -> Result<()> {
    let config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Tenants(cmd) => handle_tenant_command(cmd, &config, output).await,
        Commands::Users(cmd) => handle_user_command(cmd, &config, output).await,
        Commands::Check {
            tenant,
            user_id,
            permission,
        } => handle_check_command(tenant, user_id, permission, &config, output).await,
        Commands::Token(cmd) => handle_token_command(cmd, &config, output),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);

    if let Err(e) = run(cli, &output).await {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
