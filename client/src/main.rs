//! freva-client binary: search, metadata and auth subcommands.

use clap::{Args, Parser, Subcommand};

use freva_client::auth::Auth;
use freva_client::databrowser;
use freva_client::Config;

/// Exit code on user interrupt.
const EXIT_INTERRUPT: i32 = 150;

/// Talk to the freva databrowser REST API.
#[derive(Parser)]
#[command(name = "freva-client", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SearchArgs {
    /// Search constraints, format: KEY=VALUE (repeatable)
    facets: Vec<String>,

    /// Hostname of the databrowser API (default: from config files)
    #[arg(long, env = "FREVA_HOST")]
    host: Option<String>,

    /// The metadata naming convention
    #[arg(long, default_value = "freva")]
    flavour: String,

    /// Return file paths or uris
    #[arg(long, default_value = "file")]
    uniq_key: String,

    /// Subset results by time range, e.g. "2000 to 2012"
    #[arg(long)]
    time: Option<String>,

    /// How the time range selects records: flexible, strict or file
    #[arg(long)]
    time_select: Option<String>,

    /// Subset results by bounding box, "min_lon,max_lon by min_lat,max_lat"
    #[arg(long)]
    bbox: Option<String>,

    /// How the bounding box selects records: flexible, strict or file
    #[arg(long)]
    bbox_select: Option<String>,

    /// Search all dataset versions instead of the latest only
    #[arg(long)]
    multi_version: bool,
}

impl SearchArgs {
    fn config(&self) -> anyhow::Result<Config> {
        Ok(Config::new(self.host.as_deref(), &self.uniq_key, &self.flavour)?)
    }

    fn params(&self) -> Vec<(String, String)> {
        let mut params = databrowser::parse_cli_args(&self.facets);
        if let Some(time) = &self.time {
            params.push(("time".to_string(), time.clone()));
        }
        if let Some(time_select) = &self.time_select {
            params.push(("time_select".to_string(), time_select.clone()));
        }
        if let Some(bbox) = &self.bbox {
            params.push(("bbox".to_string(), bbox.clone()));
        }
        if let Some(bbox_select) = &self.bbox_select {
            params.push(("bbox_select".to_string(), bbox_select.clone()));
        }
        if self.multi_version {
            params.push(("multi-version".to_string(), "true".to_string()));
        }
        params
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Search for datasets and print one result per line
    Databrowser {
        #[command(flatten)]
        search: SearchArgs,

        /// Print the number of matching records instead of the records
        #[arg(long)]
        count: bool,
    },
    /// Print the metadata (facet values and counts) of a search
    Metadata {
        #[command(flatten)]
        search: SearchArgs,

        /// Count only these facets (repeatable)
        #[arg(long = "facet")]
        facet: Vec<String>,

        /// Print only the per-facet occurrence counts
        #[arg(long)]
        count: bool,
    },
    /// List all search flavours and their attributes
    Overview {
        /// Hostname of the databrowser API (default: from config files)
        #[arg(long, env = "FREVA_HOST")]
        host: Option<String>,
    },
    /// Create an access token
    Auth {
        /// Hostname of the databrowser API (default: from config files)
        #[arg(long, env = "FREVA_HOST")]
        host: Option<String>,

        /// Username to create the token for
        #[arg(short = 'u', long)]
        username: String,

        /// Password; falls back to $FREVA_PASSWORD
        #[arg(long, env = "FREVA_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Databrowser { search, count } => {
            let config = search.config()?;
            let params = search.params();
            if count {
                let total = databrowser::count(&config, &params, false).await?;
                println!("{total}");
            } else {
                databrowser::data_search(&config, &params, std::io::stdout()).await?;
            }
        }
        Commands::Metadata { search, facet, count } => {
            let config = search.config()?;
            let mut params = search.params();
            for name in facet {
                params.push(("facets".to_string(), name));
            }
            let result = if count {
                databrowser::count(&config, &params, true).await?
            } else {
                databrowser::metadata_search(&config, &params).await?
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Overview { host } => {
            let config = Config::new(host.as_deref(), "file", "freva")?;
            let result = databrowser::overview(&config).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Auth { host, username, password } => {
            let config = Config::new(host.as_deref(), "file", "freva")?;
            let mut auth = Auth::new(config.token_url());
            let token = auth.authenticate(&username, &password).await?;
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();
    let cli = Cli::parse();
    let code = tokio::select! {
        result = run(cli) => match result {
            Ok(()) => 0,
            Err(error) => {
                eprintln!("Error: {error}");
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("User interrupt: Exit");
            EXIT_INTERRUPT
        }
    };
    std::process::exit(code);
}
