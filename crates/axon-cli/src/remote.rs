//! Remote mode: telemetry arrives from a bridge server over TCP and drives a
//! local face controller.  Commands typed here travel back over the bridge.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axon_bridge::{BridgeClient, BridgeClientConfig, BridgeClientHandle, BridgeEvent, ClientState};
use axon_perception::{EmotionPolicy, GyroCalibrator};
use axon_runtime::{
    ControllerStatus, FaceController, LogObserver, PipelineControl, WatchObserver, run_pipeline,
};
use axon_types::{AxonError, CommandSink, EmotionState, TelemetryFrame};
use colored::Colorize;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::repl::{self, Console};
use crate::{print_face, print_status};

const SAMPLE_BACKLOG: usize = 1024;

pub fn run(addr: String, runtime: &Runtime, shutdown: Arc<AtomicBool>) -> Result<(), AxonError> {
    let (client, mut events) = {
        let _guard = runtime.enter();
        BridgeClient::spawn(BridgeClientConfig::default().with_addr(addr.clone()))
    };

    let (face_observer, face) = WatchObserver::new();
    let controller = FaceController::new(GyroCalibrator::default(), EmotionPolicy::default())
        .with_observer(Box::new(LogObserver::new()))
        .with_observer(Box::new(face_observer));
    let status = controller.subscribe_status();
    let (sample_tx, samples) = mpsc::channel(SAMPLE_BACKLOG);
    let (control_tx, control_rx) = mpsc::channel(8);
    let pipeline = runtime.spawn(run_pipeline(controller, samples, control_rx));

    let printer = runtime.spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::Frame(TelemetryFrame::Telemetry { sample, .. })
                | BridgeEvent::Heartbeat(sample) => {
                    if sample_tx.try_send(sample).is_err() {
                        debug!("pipeline backlog full; sample dropped");
                    }
                }
                BridgeEvent::Frame(TelemetryFrame::CommandEcho {
                    seq,
                    client_id,
                    raw_text,
                }) => {
                    println!(
                        "  {} {} {} {}",
                        chrono::Local::now().format("%H:%M:%S").to_string().dimmed(),
                        format!("CMD #{seq}").cyan(),
                        format!("from client {client_id}:").dimmed(),
                        raw_text.bold()
                    );
                }
                BridgeEvent::Notice(text) => println!("  {}", text.dimmed()),
                BridgeEvent::Connected => println!("  {}", "Bridge connected.".green()),
                BridgeEvent::Disconnected { reason } => {
                    println!("  {} ({reason})", "Bridge disconnected; retrying …".yellow());
                }
            }
        }
    });

    println!("  Bridge : {}", addr.bold());
    println!("  Type {} for commands.\n", "/help".bold().cyan());

    let console = RemoteConsole {
        addr,
        client: client.clone(),
        control: control_tx.clone(),
        status,
        face,
    };
    let result = repl::run(&console, shutdown);
    drop(console);

    info!("shutting down");
    client.shutdown();
    let _ = control_tx.try_send(PipelineControl::Shutdown);
    runtime.block_on(async {
        let _ = printer.await;
        let _ = pipeline.await;
    });

    result.map_err(|e| AxonError::Config(format!("console failed: {e}")))
}

struct RemoteConsole {
    addr: String,
    client: BridgeClientHandle,
    control: mpsc::Sender<PipelineControl>,
    status: watch::Receiver<ControllerStatus>,
    face: watch::Receiver<EmotionState>,
}

impl Console for RemoteConsole {
    fn status(&self) {
        let state = match self.client.state() {
            ClientState::Active => "connected".green(),
            ClientState::Connecting => "connecting".yellow(),
            ClientState::Reconnecting => "reconnecting".yellow(),
            ClientState::Closed => "closed".red(),
        };
        println!();
        println!("{}", "Bridge".bold().underline());
        println!("  server      : {} ({state})", self.addr);
        print_status(&self.status.borrow());
        print_face(&self.face.borrow());
        println!();
    }

    fn clients(&self) {
        println!("  Client list is only available on the bridge host.");
    }

    fn recalibrate(&self) {
        match self.control.try_send(PipelineControl::ResetCalibration) {
            Ok(()) => println!("  {}", "Calibration reset; hold still.".green()),
            Err(e) => println!("{}: {e}", "Pipeline unavailable".red()),
        }
    }

    fn reconnect(&self) {
        self.client.reconnect_now();
        println!("  {}", "Reconnecting to bridge …".yellow());
    }

    fn send(&self, text: &str) {
        match self.client.send_command(text) {
            Ok(()) => {}
            Err(AxonError::NotConnected) => {
                println!("  {}", "Not connected; command dropped.".yellow());
            }
            Err(e) => println!("{}: {e}", "Command not sent".red()),
        }
    }
}
