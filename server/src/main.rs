use clap::Parser;
use log::debug;
use server::notify::NotificationSink;
use server::registry::ServerConfig;
use server::server::Server;

/// Dual-transport multiplayer relay server.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Host address to bind both transports to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Stream transport (TCP) port
    #[clap(short, long, default_value = "4110")]
    port: u16,
    /// Poll transport (HTTP) port
    #[clap(long, default_value = "4111")]
    http_port: u16,
    /// Address advertised in discovery listings
    #[clap(long, default_value = "127.0.0.1")]
    advertise: String,
    /// Server display name
    #[clap(short, long, default_value = "Relay Server")]
    name: String,
    /// Message of the day, sent as a system chat on join
    #[clap(short, long, default_value = "")]
    motd: String,
    /// Maximum concurrent players
    #[clap(long, default_value = "8")]
    max_players: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        name: args.name,
        motd: args.motd,
        max_players: args.max_players,
    };

    // The dashboard hooks onto this receiver; without one attached the
    // relay behaves identically, so just trace the feed.
    let (notify, mut notifications) = NotificationSink::attached();
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            debug!("Notification: {:?}", notification);
        }
    });

    let server = Server::bind(
        &format!("{}:{}", args.host, args.port),
        &format!("{}:{}", args.host, args.http_port),
        args.advertise,
        config,
        notify,
    )
    .await?;

    server.run().await
}
