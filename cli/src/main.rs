use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bulletin::{
    net::{quic::QuicTransport, DEFAULT_PORT},
    Arg, BoardConfig, Call, Client, Executor, FunctionTable, NetConfig, TaskFailure,
    TaskValue, Working,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Run a bulletin board master, worker, or in-process demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the board, submit demo tasks and print their results.
    Master {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        addr: SocketAddr,
        /// Number of tasks to submit.
        #[arg(long, default_value_t = 16)]
        tasks: u32,
        /// Leave execution to the workers.
        #[arg(long)]
        idle: bool,
    },
    /// Join a master and run tasks until it quits.
    Worker {
        #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
        addr: SocketAddr,
    },
    /// Compute fib(n) recursively on a board with no workers.
    Solo {
        #[arg(long, default_value_t = 15)]
        n: u32,
    },
}

/// `square` from the table, plus a `fib` that recurses through the board.
struct Demo {
    table: FunctionTable,
}

impl Demo {
    fn new() -> Self {
        let table = FunctionTable::new().register("square", |args| {
            let x = args.first().and_then(Arg::as_scalar).unwrap_or_default();
            Ok(TaskValue::Scalar(x * x))
        });
        Self { table }
    }
}

fn fib(n: f64) -> Call {
    Call::function("fib", vec![Arg::Scalar(n)])
}

#[async_trait]
impl Executor for Demo {
    async fn execute(
        &self,
        client: &mut Client,
        call: Call,
    ) -> Result<TaskValue, TaskFailure> {
        let n = match &call {
            Call::Function { name, args } if name == "fib" => {
                args.first().and_then(Arg::as_scalar).unwrap_or_default()
            }
            _ => return self.table.call(&call),
        };
        if n < 2.0 {
            return Ok(TaskValue::Scalar(n));
        }
        client.submit(1, fib(n - 1.0)).await?;
        client.submit(2, fib(n - 2.0)).await?;
        let mut sum = 0.0;
        while let Working::Completed(done) = client.working().await? {
            sum += done.scalar().ok_or_else(|| {
                TaskFailure(format!("fib subtask {} failed", done.id))
            })?;
        }
        Ok(TaskValue::Scalar(sum))
    }
}

#[tokio::main]
async fn main() -> bulletin::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Master { addr, tasks, idle } => {
            let transport =
                QuicTransport::listen(&NetConfig::builder().addr(addr).build()).await?;
            info!(addr = %transport.local_addr()?, "serving");
            let config = BoardConfig::builder().master_works(!idle).build();
            let mut client = Client::master(transport, Arc::new(Demo::new()), config)?;

            for i in 0..tasks {
                let x = f64::from(i);
                client
                    .submit(i as i32, Call::function("square", vec![Arg::Scalar(x)]))
                    .await?;
            }
            while let Working::Completed(done) = client.working().await? {
                match done.outcome {
                    Ok(value) => println!("{:>4}: {value:?}", done.requester),
                    Err(failure) => println!("{:>4}: {failure}", done.requester),
                }
            }
            client.done().await?;
            info!(stats = ?client.stats(), "done");
        }
        Command::Worker { addr } => {
            let transport =
                QuicTransport::connect(&NetConfig::builder().addr(addr).build()).await?;
            let mut client =
                Client::join(transport, Arc::new(Demo::new()), BoardConfig::default())
                    .await?;
            client.worker().await?;
            info!(stats = ?client.stats(), "quit");
        }
        Command::Solo { n } => {
            let mut client = Client::solo(Arc::new(Demo::new()));
            client.submit(0, fib(f64::from(n))).await?;
            if let Some(done) = client.working().await?.completion() {
                println!("fib({n}) = {:?}", done.outcome);
            }
            info!(stats = ?client.stats(), "done");
        }
    }
    Ok(())
}
