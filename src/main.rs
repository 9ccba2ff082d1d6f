// SPDX-License-Identifier: Apache-2.0

// vfdw command line front end

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use vfdw::export::{default_file_name, export_to_file};
use vfdw::observability::{init_tracing, log_directory};
use vfdw::{
    build_engine, ConfigStore, ConnectionProfile, CredentialProvider, Credentials, JoinRule,
    JoinType, KeyringProvider,
};

#[derive(Parser)]
#[command(
    name = "vfdw",
    version,
    about = "Query tables living in independent relational backends as one database"
)]
struct Cli {
    /// Configuration file (default: <data dir>/vfdw/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write a rolling JSON log under the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one or more `;`-separated SELECT statements
    Query { sql: String },
    /// Show how a statement would be executed, without connecting
    Explain { sql: String },
    /// Run a statement and write its result as CSV
    Export {
        sql: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Table identifier → backend mapping
    #[command(subcommand)]
    Mapping(MappingCommand),
    /// Join rules
    #[command(subcommand)]
    Rule(RuleCommand),
    /// Backend connection profiles
    #[command(subcommand)]
    Connection(ConnectionCommand),
    /// Backend logins kept in the OS keyring
    #[command(subcommand)]
    Credentials(CredentialsCommand),
}

#[derive(Subcommand)]
enum MappingCommand {
    List,
    Add { table: String, backend: String },
    Remove { table: String },
}

#[derive(Subcommand)]
enum RuleCommand {
    List,
    Add {
        /// Comma-separated table identifiers
        #[arg(long, value_delimiter = ',', required = true)]
        tables: Vec<String>,
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "inner")]
        join_type: JoinType,
        #[arg(long)]
        pushdown: bool,
        /// Per-table key column, as `table=column`
        #[arg(long = "key-column", value_parser = parse_key_column)]
        key_columns: Vec<(String, String)>,
    },
    Remove { index: usize },
}

#[derive(Subcommand)]
enum ConnectionCommand {
    List,
    Add {
        name: String,
        #[arg(long, default_value = "postgres")]
        driver: String,
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value_t = 5432)]
        port: u16,
        #[arg(long)]
        database: String,
    },
    Remove { name: String },
    Test { name: String },
}

#[derive(Subcommand)]
enum CredentialsCommand {
    Set {
        name: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
    },
    Delete { name: String },
}

fn parse_key_column(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(table, column)| (table.trim().to_string(), column.trim().to_string()))
        .filter(|(table, column)| !table.is_empty() && !column.is_empty())
        .ok_or_else(|| format!("expected table=column, got '{raw}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.then(log_directory).as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let store = match cli.config {
        Some(path) => ConfigStore::new(path),
        None => ConfigStore::new(ConfigStore::default_path()?),
    };
    let mut config = store.load()?;

    match cli.command {
        Command::Query { sql } => {
            let engine = build_engine(config);
            for result in engine.execute_script(&sql).await? {
                println!("{result}\n");
            }
        }
        Command::Explain { sql } => {
            let engine = build_engine(config);
            print!("{}", engine.explain(&sql)?);
        }
        Command::Export { sql, out } => {
            let engine = build_engine(config);
            let result = engine.execute(&sql).await?;
            let path = out.unwrap_or_else(|| PathBuf::from(default_file_name()));
            export_to_file(&result, &path)?;
            println!("{} rows written to {}", result.row_count(), path.display());
        }
        Command::Mapping(command) => {
            match command {
                MappingCommand::List => {
                    for (table, backend) in &config.table_mapping {
                        println!("{table} -> {backend}");
                    }
                    return Ok(());
                }
                MappingCommand::Add { table, backend } => {
                    config.map_table(table, &backend)?;
                }
                MappingCommand::Remove { table } => {
                    config.unmap_table(&table)?;
                }
            }
            store.save(&config)?;
        }
        Command::Rule(command) => {
            match command {
                RuleCommand::List => {
                    for (index, rule) in config.join_rules.iter().enumerate() {
                        println!("[{index}] {rule}");
                    }
                    return Ok(());
                }
                RuleCommand::Add {
                    tables,
                    key,
                    join_type,
                    pushdown,
                    key_columns,
                } => {
                    let rule = key_columns.into_iter().fold(
                        JoinRule::new(tables, key)
                            .with_join_type(join_type)
                            .with_pushdown(pushdown),
                        |rule, (table, column)| rule.with_key_column(table, column),
                    );
                    config.add_join_rule(rule)?;
                }
                RuleCommand::Remove { index } => {
                    config.remove_join_rule(index)?;
                }
            }
            store.save(&config)?;
        }
        Command::Connection(command) => {
            match command {
                ConnectionCommand::List => {
                    for (name, profile) in &config.connections {
                        println!(
                            "{name}: {}://{}:{}/{}",
                            profile.driver, profile.host, profile.port, profile.database
                        );
                    }
                    return Ok(());
                }
                ConnectionCommand::Test { name } => {
                    build_engine(config).test_connection(&name).await?;
                    println!("Connection '{name}' OK");
                    return Ok(());
                }
                ConnectionCommand::Add {
                    name,
                    driver,
                    host,
                    port,
                    database,
                } => {
                    config.add_connection(name, ConnectionProfile::new(driver, host, port, database))?;
                }
                ConnectionCommand::Remove { name } => {
                    config.remove_connection(&name)?;
                }
            }
            store.save(&config)?;
        }
        Command::Credentials(command) => {
            let provider = KeyringProvider::new();
            match command {
                CredentialsCommand::Set {
                    name,
                    user,
                    password,
                } => provider.save_credentials(&name, &Credentials::new(user, password))?,
                CredentialsCommand::Delete { name } => provider.delete_credentials(&name)?,
            }
        }
    }
    Ok(())
}
