//! Local modes (`sim`, `serial`): the link is attached to this process.
//!
//! ```text
//!  SensorLink ─▶ acquisition thread ─▶ pipeline task ─▶ observers
//!                     ▲                      │
//!                     │ commands             └─▶ BridgeIngest ─▶ bridge clients
//!                     └──────── bridge stage ◀── client / console commands
//! ```

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axon_bridge::{BridgeHandle, BridgeIngest, BridgeServer, BridgeServerConfig, LOCAL_CLIENT_ID};
use axon_hal::{AcquisitionConfig, AcquisitionHandle, AcquisitionLoop, SensorLink, spawn_acquisition};
use axon_perception::{EmotionPolicy, GyroCalibrator};
use axon_runtime::{
    ControllerStatus, FaceController, LogObserver, PipelineControl, WatchObserver, run_pipeline,
};
use axon_types::{AxonError, EmotionState};
use colored::Colorize;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::Config;
use crate::repl::{self, Console};
use crate::{print_face, print_status};

/// Samples buffered between the acquisition thread and the pipeline.
const SAMPLE_BACKLOG: usize = 1024;

pub fn run(
    cfg: &Config,
    link: Box<dyn SensorLink>,
    runtime: &Runtime,
    shutdown: Arc<AtomicBool>,
) -> Result<(), AxonError> {
    let link_name = link.describe();
    let acquisition = AcquisitionLoop::new(link, AcquisitionConfig::default());
    let (link_handle, samples) = spawn_acquisition(acquisition, SAMPLE_BACKLOG)?;

    let server_config = BridgeServerConfig::default()
        .with_addr(cfg.bridge_addr()?)
        .with_queue_capacity(cfg.client_queue);
    let server = match runtime.block_on(BridgeServer::bind(
        server_config,
        Arc::new(link_handle.clone()),
    )) {
        Ok(server) => server,
        Err(e) => {
            link_handle.shutdown();
            return Err(e);
        }
    };
    let bridge = {
        let _guard = runtime.enter();
        server.spawn()
    };
    let ingest = bridge.ingest();

    let (face_observer, face) = WatchObserver::new();
    let controller = FaceController::new(GyroCalibrator::default(), EmotionPolicy::default())
        .with_observer(Box::new(LogObserver::new()))
        .with_observer(Box::new(face_observer))
        .with_telemetry_sink(Arc::new(ingest.clone()));
    let status = controller.subscribe_status();
    let (control_tx, control_rx) = mpsc::channel(8);
    let pipeline = runtime.spawn(run_pipeline(controller, samples, control_rx));

    println!(
        "  Link   : {}",
        link_name.bold()
    );
    println!(
        "  Bridge : listening on {}",
        bridge.local_addr().to_string().bold()
    );
    println!(
        "  Hold the robot still for a few seconds to calibrate the gyro.  Type {} for commands.\n",
        "/help".bold().cyan()
    );

    let console = LocalConsole {
        link_name,
        link: link_handle.clone(),
        bridge: &bridge,
        ingest,
        control: control_tx.clone(),
        status,
        face,
        runtime,
    };
    let result = repl::run(&console, shutdown);
    drop(console);

    info!("shutting down");
    let _ = control_tx.try_send(PipelineControl::Shutdown);
    link_handle.shutdown();
    runtime.block_on(async {
        let _ = pipeline.await;
        bridge.shutdown().await;
    });

    result.map_err(|e| AxonError::Config(format!("console failed: {e}")))
}

struct LocalConsole<'a> {
    link_name: String,
    link: AcquisitionHandle,
    bridge: &'a BridgeHandle,
    ingest: BridgeIngest,
    control: mpsc::Sender<PipelineControl>,
    status: watch::Receiver<ControllerStatus>,
    face: watch::Receiver<EmotionState>,
    runtime: &'a Runtime,
}

impl Console for LocalConsole<'_> {
    fn status(&self) {
        let stats = self.link.stats();
        println!();
        println!("{}", "Link".bold().underline());
        println!("  device      : {}", self.link_name);
        println!(
            "  samples {}  heartbeats {}  malformed {}  reconnects {}",
            stats.samples, stats.heartbeats, stats.malformed, stats.reconnects
        );
        println!(
            "  commands written {}  dropped {}  backlog dropped {}",
            stats.commands_written, stats.commands_dropped, stats.backlog_dropped
        );
        print_status(&self.status.borrow());
        print_face(&self.face.borrow());
        println!(
            "  bridge ingest dropped {}",
            self.ingest.dropped()
        );
        println!();
    }

    fn clients(&self) {
        match self.runtime.block_on(self.bridge.client_stats()) {
            Ok(clients) if clients.is_empty() => println!("  No bridge clients connected."),
            Ok(clients) => {
                println!("{}", "Bridge clients".bold().underline());
                for c in clients {
                    println!(
                        "  #{:<4} {:<22} {:<9} queued {:<4} dropped {}",
                        c.client_id,
                        c.peer.to_string(),
                        c.state.to_string(),
                        c.queued,
                        c.dropped
                    );
                }
            }
            Err(e) => println!("{}: {e}", "Bridge unavailable".red()),
        }
    }

    fn recalibrate(&self) {
        match self.control.try_send(PipelineControl::ResetCalibration) {
            Ok(()) => println!("  {}", "Calibration reset; hold still.".green()),
            Err(e) => println!("{}: {e}", "Pipeline unavailable".red()),
        }
    }

    fn reconnect(&self) {
        self.link.reset();
        println!("  {}", "Reconnecting link …".yellow());
    }

    fn send(&self, text: &str) {
        match self.ingest.submit_local_command(text) {
            Ok(()) => println!(
                "  {} {} {}",
                "→".green(),
                text.bold(),
                format!("(client {LOCAL_CLIENT_ID})").dimmed()
            ),
            Err(e) => println!("{}: {e}", "Command not sent".red()),
        }
    }
}
