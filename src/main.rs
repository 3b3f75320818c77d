use std::path::PathBuf;
use std::sync::Arc;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use wmbus2mqtt::config::{Config, OutputFormat};
use wmbus2mqtt::meters::{create_meter, ElectricityMeter, Meter, MeterUpdate};
use wmbus2mqtt::wmbus::{parse_frame, parse_input_line, LinkMode, WMBus};
#[cfg(feature = "mqtt")]
use wmbus2mqtt::mqtt::MqttPublisher;
#[cfg(feature = "shell")]
use wmbus2mqtt::shell::invoke_shell;

/// Everything a report is fed to
#[derive(Clone)]
struct Outputs {
    format: OutputFormat,
    separator: char,
    #[cfg(feature = "shell")]
    shell: Vec<String>,
    #[cfg(feature = "mqtt")]
    mqtt: Option<Arc<MqttPublisher>>,
}

/// Wait for a task and report if it died.
async fn join(what: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!("{what} failed: {e}");
    }
}

async fn emit(meter: &Arc<dyn ElectricityMeter>, update: MeterUpdate, outputs: &Outputs, commands: &mut Vec<JoinHandle<()>>) {
    let report = meter.print_meter(&update.telegram, outputs.separator);
    match outputs.format {
        OutputFormat::HumanReadable => println!("{}", report.human_readable),
        OutputFormat::Fields => println!("{}", report.fields),
        OutputFormat::Json => println!("{}", report.json),
    }

    #[cfg(feature = "shell")]
    {
        commands.retain(|c| !c.is_finished());
        for cmd in &outputs.shell {
            commands.push(invoke_shell(cmd, &report.envs));
        }
    }
    #[cfg(not(feature = "shell"))]
    let _ = commands;

    #[cfg(feature = "mqtt")]
    {
        if let Some(mqtt) = &outputs.mqtt {
            mqtt.publish(meter.name(), report.json).await;
        }
    }
}

fn spawn_reporter(meter: Arc<dyn ElectricityMeter>, outputs: Outputs, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let mut rx = meter.subscribe();
    tokio::spawn(async move {
        let mut commands: Vec<JoinHandle<()>> = Vec::new();
        loop {
            tokio::select! {
                update = rx.recv() => match update {
                    Ok(update) => emit(&meter, update, &outputs, &mut commands).await,
                    Err(RecvError::Lagged(n)) => warn!("{}: {n} updates not reported", meter.name()),
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    /* Report what is still queued before leaving */
                    while let Ok(update) = rx.try_recv() {
                        emit(&meter, update, &outputs, &mut commands).await;
                    }
                    break;
                }
            }
        }

        for command in commands {
            join("Shell command", command).await;
        }
    })
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("WMBUS_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&PathBuf::from(path)),
        None => Config::load_default(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return Err(std::io::Error::other(e.to_string()));
        }
    };

    let bus = WMBus::new(vec![LinkMode::C1]);
    let modes: Vec<String> = bus.link_modes().iter().map(|m| m.to_string()).collect();
    info!("Receiving on link modes {}", modes.join(","));

    let mut meters: Vec<Arc<dyn ElectricityMeter>> = Vec::new();
    for m in &config.meters {
        match create_meter(&bus, m, config.options()) {
            Ok(meter) => {
                if !bus.listens_on(meter.link_mode()) {
                    warn!("Meter {} transmits on {}, which is not received", m.name, meter.link_mode().to_string());
                }
                info!("Meter {} ({}) listening for {}", m.name, m.driver, m.id);
                meters.push(meter);
            }
            Err(e) => {
                error!("Unable to create meter {}: {e}", m.name);
                return Err(std::io::Error::other(e.to_string()));
            }
        }
    }

    let outputs = Outputs {
        format: config.format,
        separator: config.separator(),
        #[cfg(feature = "shell")]
        shell: config.shell.clone(),
        #[cfg(feature = "mqtt")]
        mqtt: config.mqtt.as_ref().map(|c| Arc::new(MqttPublisher::new(c))),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut threads: Vec<JoinHandle<()>> = Vec::new();
    for meter in &meters {
        threads.push(spawn_reporter(meter.clone(), outputs.clone(), shutdown_rx.clone()));
    }

    info!("All {} meters started, reading telegrams from stdin", meters.len());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (frame, simulated) = match parse_input_line(line) {
            Ok(f) => f,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };

        match parse_frame(&frame, config.frames_have_crc, simulated) {
            Ok(mut t) => {
                bus.dispatch(&mut t);
            }
            Err(e) => warn!("Dropping telegram: {e}"),
        }
    }

    info!("End of input, waiting for pending reports");
    let _ = shutdown_tx.send(true);
    for task in threads {
        join("Reporter", task).await;
    }

    #[cfg(feature = "mqtt")]
    {
        if outputs.mqtt.is_some() {
            /* Give the event loop a moment to flush the last publishes */
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    Ok(())
}
