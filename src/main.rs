use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jobrig::master::{run_master, MasterOpts};
use jobrig::shutdown::shutdown_token;
use jobrig::slave::run_slave;

#[derive(Parser, Debug)]
#[command(name = "jobrig")]
#[command(about = "Distributed job-execution fabric")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central coordinator
    Master {
        /// Port slaves connect to
        slave_port: u16,
        /// Port the admin surface binds
        admin_port: u16,
        /// Password slaves must present
        slave_pass: String,
        /// Password for the admin surface
        admin_pass: String,
        /// Path to the persisted job pool
        jobs_file: PathBuf,
    },
    /// Run a worker and connect it to a master
    Slave {
        host: String,
        port: u16,
        password: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Bad usage exits 1, like any other startup failure; help and version
    // requests still exit 0.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    let result = match args.command {
        Command::Master {
            slave_port,
            admin_port,
            slave_pass,
            admin_pass,
            jobs_file,
        } => {
            let shutdown = shutdown_token();
            run_master(
                MasterOpts {
                    slave_port,
                    admin_port,
                    slave_password: slave_pass,
                    admin_password: admin_pass,
                    jobs_path: jobs_file,
                },
                shutdown,
            )
            .await
        }
        Command::Slave {
            host,
            port,
            password,
        } => run_slave(&host, port, &password).await,
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
