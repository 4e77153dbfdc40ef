use log::{info, warn};
use spade::client::Client;
use spade::server::{Event, Server};
use std::net::SocketAddr;
use std::time::Duration;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

#[derive(StructOpt, Debug)]
#[structopt(name = "spade")]
enum Opt {
    Client(ClientOpt),
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "bind-addr", default_value = "0.0.0.0:0")]
    bind_addr: SocketAddr,

    #[structopt(long = "server-host")]
    server_host: String,

    #[structopt(long = "server-port")]
    server_port: u16,

    /// receive window in seconds
    #[structopt(long = "timeout", default_value = "10")]
    timeout: u64,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:8808")]
    listen_addr: SocketAddr,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let opt: Opt = StructOpt::from_args();

    let result = match opt {
        Opt::Client(opt) => run_client(opt).await,
        Opt::Server(opt) => run_server(opt).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        token.cancel();
    });
}

async fn run_client(opt: ClientOpt) -> Result<(), spade::Error> {
    let mut client = Client::new(opt.bind_addr);
    client.set_timeout(Duration::from_secs(opt.timeout));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let public = client
        .discover_host(&opt.server_host, opt.server_port, &cancel)
        .await?;

    println!("public endpoint: {}", public);
    Ok(())
}

async fn run_server(opt: ServerOpt) -> Result<(), spade::Error> {
    let mut server = Server::new(opt.listen_addr).await?;
    info!("listening on {}", server.local_addr()?);

    let mut events = server.events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::ReceivedRequest(addr) => info!("received request from {}", addr),
                Event::SentResponse(addr) => info!("sent response to {}", addr),
                Event::ReceivedConfirmation(addr) => info!("received confirmation from {}", addr),
                Event::ResponseConfirmed(addr) => info!("response to {} confirmed", addr),
                Event::NonfatalError(e) => warn!("{}", e),
            }
        }
    });

    cancel_on_ctrl_c(server.shutdown_token());

    server.run().await
}
