use busgate_bridge::{QueueLibBusServer, QueueServerTransport};
use busgate_core::telemetry::init_tracing;
use busgate_core::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = Settings::load();
    let name: String = settings.get_setting_or(&["bus", "name"], "busgate-server".to_string());
    let server = QueueLibBusServer::new(name.clone(), QueueServerTransport::load(&settings));
    server.enable().await?;
    tracing::info!(
        name = %name,
        addr = ?server.transport().local_addr(),
        "Busgate server ready"
    );

    let inbound = server.output_stream();
    let drain = tokio::spawn(async move {
        let mut received = 0usize;
        while let Some(message) = inbound.next().await {
            received += 1;
            tracing::info!(
                sender = %message.sender(),
                recipient = %message.target(),
                transporter = %message.transporter(),
                payload = %message.payload(),
                "Inbound message"
            );
        }
        received
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    server.disable().await;
    let received = drain.await?;
    tracing::info!(received, "Busgate server stopped");
    Ok(())
}
