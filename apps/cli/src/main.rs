use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use threadspace_core_sdk::{
    catalog,
    chat::{self, ChatRequest},
    config::AppConfig,
    db,
    llm::HttpGenerator,
    models::{CredentialConfig, Preferences, Provider},
    registry::{resolve_user_keys, ProviderRegistry},
    server, telemetry,
};

/**
 * \brief Command line entry for the Threadspace chat backend.
 */
#[derive(Parser, Debug)]
#[command(name = "threadspace", version, about = "Multi-provider chat backend")]
struct Cli {
    /// SQLite database path (overrides THREADSPACE_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Acting user id for local commands
    #[arg(long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API (and static UI when configured).
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },

    /// Send one message and stream the reply.
    Chat {
        /// Existing thread; a new one is created in the first space when omitted
        #[arg(long)]
        thread: Option<String>,
        #[arg(long, default_value_t = catalog::DEFAULT_MODEL.identifier())]
        model: String,
        #[arg(long)]
        prompt: String,
    },

    /// Manage bring-your-own-key credentials.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// List models usable with the current keys.
    Models,

    /// Manage spaces.
    Space {
        #[command(subcommand)]
        action: SpaceAction,
    },

    /// Manage the user profile used in system prompts.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    Set {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        api_key: String,
    },
    List,
    Remove {
        #[arg(long)]
        provider: String,
    },
}

#[derive(Subcommand, Debug)]
enum SpaceAction {
    Create {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    Set {
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        profession: String,
        #[arg(long, default_value = "")]
        instructions: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(path) = cli.db {
        config.database_path = path;
    }
    telemetry::init(&config.log_level, config.log_file.as_deref())
        .context("init logging failed")?;

    let conn = db::open(&config.database_path).context("open database failed")?;
    db::migrate(&conn).context("apply schema failed")?;
    let user = cli.user;

    match cli.command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.addr = addr;
            }
            drop(conn);
            server::run(config).await?;
        }
        Commands::Chat {
            thread,
            model,
            prompt,
        } => {
            let thread_id = match thread {
                Some(id) => id,
                None => {
                    let space = match db::list_spaces(&conn, &user)?.into_iter().next() {
                        Some(space) => space,
                        None => db::create_space(&conn, &user, None, None)
                            .context("create space failed")?,
                    };
                    let thread = db::create_thread(&conn, &user, &space.id, None)
                        .context("create thread failed")?;
                    println!("Created thread id={} (space={})", thread.id, space.name);
                    thread.id
                }
            };

            let request = ChatRequest {
                thread_id,
                model,
                content: prompt,
            };
            match catalog::find_model(&request.model) {
                Some(info) => println!("[{}]", info.name),
                None => info!(model = %request.model, "model is not in the catalog, sending as given"),
            }
            let generator = HttpGenerator::new();
            let outcome = chat::run_turn(
                &conn,
                &config.defaults,
                &generator,
                Some(user.as_str()),
                &request,
                |delta| {
                    print!("{}", delta);
                    std::io::stdout().flush().ok();
                },
            )
            .await
            .context("chat failed")?;
            println!();
            info!(
                thread_id = %outcome.thread_id,
                assistant_id = %outcome.assistant_message.id,
                "reply stored"
            );
        }
        Commands::Keys { action } => match action {
            KeysAction::Set { provider, api_key } => {
                let provider: Provider = provider.parse()?;
                let config = CredentialConfig::from_input(&api_key)?;
                db::add_user_key(&conn, &user, provider, &config).context("save key failed")?;
                println!("Saved {} key for {}", provider.display_name(), user);
            }
            KeysAction::List => {
                for record in resolve_user_keys(&conn, Some(user.as_str()))? {
                    println!("{}", record.provider);
                }
            }
            KeysAction::Remove { provider } => {
                let provider: Provider = provider.parse()?;
                if db::delete_user_key(&conn, &user, provider)? {
                    println!("Removed {} key", provider.display_name());
                } else {
                    println!("No {} key stored", provider.display_name());
                }
            }
        },
        Commands::Models => {
            let keys = resolve_user_keys(&conn, Some(user.as_str()))?;
            let registry = ProviderRegistry::for_user(&config.defaults, &keys);
            let models = catalog::available_models(&registry);
            if models.is_empty() {
                println!("No provider keys configured; set one with `threadspace keys set`.");
            }
            for m in models {
                println!("{:<45} {}", m.identifier(), m.name);
            }
        }
        Commands::Space { action } => match action {
            SpaceAction::Create { name, prompt } => {
                let space = db::create_space(&conn, &user, name.as_deref(), prompt.as_deref())
                    .context("create space failed")?;
                println!("Created space id={} (name={})", space.id, space.name);
            }
            SpaceAction::List => {
                for space in db::list_spaces(&conn, &user)? {
                    println!("{}  {}", space.id, space.name);
                }
            }
        },
        Commands::Profile { action } => match action {
            ProfileAction::Set {
                name,
                profession,
                instructions,
            } => {
                db::upsert_preferences(
                    &conn,
                    &Preferences {
                        user_id: user.clone(),
                        name,
                        profession,
                        custom_instructions: instructions,
                    },
                )
                .context("save profile failed")?;
                println!("Saved profile for {}", user);
            }
        },
    }

    Ok(())
}
