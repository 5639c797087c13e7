use headphone_link::domain::settings::SettingsService;
use headphone_link::infrastructure::bluetooth::simulator::SimulatedHeadphones;
use headphone_link::infrastructure::bluetooth::{HeadphoneService, ServiceConfig};
use headphone_link::infrastructure::logging;
use headphone_link::infrastructure::storage::FileArtifactStore;
use headphone_link::presentation::console::Console;
use tokio::sync::mpsc;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Headphone Link");

    let settings = settings_service.get().clone();
    let config = ServiceConfig::from_settings(&settings)?;
    let store = FileArtifactStore::new(settings.artifact_dir());
    info!("Received files go to {}", store.dir().display());

    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (bt_cmd_tx, bt_cmd_rx) = mpsc::unbounded_channel();

    let worker = std::thread::Builder::new()
        .name("bluetooth".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create tokio runtime for Bluetooth: {}", e);
                    return;
                }
            };

            rt.block_on(async move {
                let (event_tx, event_rx) = mpsc::unbounded_channel();
                let transport = SimulatedHeadphones::new(config.layout.clone(), event_tx);
                transport.power_on();

                let service = HeadphoneService::new(transport, config, Box::new(store), app_tx);
                service.run(bt_cmd_rx, event_rx).await;
            });
        })?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(Console::new(settings_service, bt_cmd_tx).run(app_rx));
    // Do not wait on a stdin read that may still be parked
    rt.shutdown_background();

    // The console owned the command sender; its drop ends the worker loop
    if worker.join().is_err() {
        error!("Bluetooth worker panicked");
    }
    info!("Headphone Link stopped");
    result
}
