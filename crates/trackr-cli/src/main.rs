mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, rule::RuleSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "trackr",
    about = "Runtime-defined record collections with a worker pool and insert alerts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .trackr/)
    #[arg(long, global = true, env = "TRACKR_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize trackr in the current directory
    Init,

    /// List registered objects
    Objects {
        /// Include system collections
        #[arg(long)]
        system: bool,
    },

    /// Show the fields of an object
    Schema { name: String },

    /// Create an object
    Create {
        name: String,
        /// URL-safe alias (default: derived from the name)
        #[arg(long)]
        alias: Option<String>,
        /// Field as NAME:TYPE[:required][:unique][:default=VALUE]
        #[arg(long = "field", short = 'f', value_name = "SPEC")]
        fields: Vec<String>,
    },

    /// Drop an object and its records
    Drop { name: String },

    /// Insert records given as a JSON object or array
    Insert { name: String, data: String },

    /// Query records
    Select {
        name: String,
        /// Equality filter FIELD=VALUE (repeatable)
        #[arg(long = "where", short = 'w', value_name = "FIELD=VALUE")]
        filters: Vec<String>,
        /// Comma-separated fields to return
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Field to order by (default: _id)
        #[arg(long)]
        sort: Option<String>,
        /// Order descending
        #[arg(long)]
        desc: bool,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Delete matching records
    Delete {
        name: String,
        #[arg(long = "where", short = 'w', value_name = "FIELD=VALUE")]
        filters: Vec<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Update matching records
    Update {
        name: String,
        /// Change FIELD=VALUE (repeatable)
        #[arg(long = "set", short = 's', value_name = "FIELD=VALUE", required = true)]
        changes: Vec<String>,
        #[arg(long = "where", short = 'w', value_name = "FIELD=VALUE")]
        filters: Vec<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Manage alert rules
    Rule {
        #[command(subcommand)]
        subcommand: RuleSubcommand,
    },

    /// Show alert finds, newest first
    Alerts {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show recent inserts across objects
    Recent,

    /// Show tasks waiting in the recovery file
    Pending,

    /// Inspect and validate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Objects { system } => cmd::objects::run(&root, system, cli.json),
        Commands::Schema { name } => cmd::schema::run(&root, &name, cli.json),
        Commands::Create {
            name,
            alias,
            fields,
        } => cmd::create::run(&root, &name, alias.as_deref(), &fields, cli.json),
        Commands::Drop { name } => cmd::drop::run(&root, &name, cli.json),
        Commands::Insert { name, data } => cmd::insert::run(&root, &name, &data, cli.json),
        Commands::Select {
            name,
            filters,
            fields,
            sort,
            desc,
            limit,
            offset,
        } => cmd::select::run(
            &root,
            &name,
            cmd::select::SelectArgs {
                filters,
                fields,
                sort,
                desc,
                limit,
                offset,
            },
            cli.json,
        ),
        Commands::Delete {
            name,
            filters,
            limit,
            offset,
        } => cmd::delete::run(&root, &name, &filters, limit, offset, cli.json),
        Commands::Update {
            name,
            changes,
            filters,
            limit,
            offset,
        } => cmd::update::run(&root, &name, &changes, &filters, limit, offset, cli.json),
        Commands::Rule { subcommand } => cmd::rule::run(&root, subcommand, cli.json),
        Commands::Alerts { limit } => cmd::alerts::run(&root, limit, cli.json),
        Commands::Recent => cmd::recent::run(&root, cli.json),
        Commands::Pending => cmd::pending::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
