//! # Lumen CNC controller daemon
//!
//! Startup wires the subsystems in dependency order (FSM coordinator,
//! command interface, hardware monitors, then motion) and hands control
//! to the selected transport until a shutdown signal arrives.

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser as ClapParser;
use tokio::sync::mpsc;
use tracing::info;

use lumen_host::cli::{self, CliContext};
use lumen_host::config::HostConfig;
use lumen_host::console;
use lumen_host::fsm::Fsm;
use lumen_host::gcode_worker::{self, WorkerConfig};
use lumen_host::limits;
use lumen_host::messages::{Message, MessageSender};
use lumen_host::motion_ctl::{MotionCtl, SharedMotion};
use lumen_host::pulse::{self, FileSink};
use lumen_host::socket;
use lumen_host::stepgen::StepGen;
use lumen_host::switches;

use motion::stepper::SysPosition;

/// Motion controller daemon for the Lumen laser CNC.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the machine configuration file.
    #[arg(short, long, default_value = "lumen.cfg")]
    config: PathBuf,

    /// Listen on a TCP socket instead of the console.
    #[arg(short, long)]
    socket: bool,

    /// Address to listen on in socket mode.
    #[arg(long, default_value = "127.0.0.1")]
    listen_ip: String,

    /// Port to listen on in socket mode.
    #[arg(short = 'p', long, default_value_t = 51401)]
    listen_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    let config = HostConfig::load(&args.config)?;
    let settings = Arc::new(config.motion.clone());
    info!("starting Lumen CNC controller");

    // Shared state: machine position and the planner/segment rings. The
    // planner starts from wherever the hardware last was.
    let position = Arc::new(SysPosition::new());
    let shared_motion = SharedMotion::new(settings.clone());
    shared_motion
        .state
        .lock()
        .planner
        .sync_position(&position.snapshot());

    // System FSM first; everything else registers with it.
    let fsm = Fsm::spawn();

    // Command interface.
    let (messages, outbound) = MessageSender::channel();
    cli::register(&fsm, messages.clone());
    let (gcode_tx, gcode_rx) = crossbeam_channel::bounded::<String>(16);

    // Hardware: pulse driver, then the input monitors. The event senders
    // stay alive here; a device reader process would feed them.
    pulse::register_driver(&fsm);
    let sink = Box::new(FileSink::create(&config.pulse_device)?);

    // Motion: the step generator thread and the G-code worker.
    let stepgen = StepGen::spawn(
        shared_motion.clone(),
        fsm.clone(),
        position.clone(),
        settings.clone(),
        sink,
    );

    let (_limit_events, limit_rx) = mpsc::unbounded_channel();
    limits::spawn(fsm.clone(), limit_rx);
    let (_switch_events, switch_rx) = mpsc::unbounded_channel();
    switches::spawn(fsm.clone(), stepgen.clone(), switch_rx);

    let motion_ctl = MotionCtl::new(
        settings.clone(),
        shared_motion.clone(),
        fsm.clone(),
        stepgen.clone(),
        messages.clone(),
        config.cli.auto_cycle,
    );
    let worker = gcode_worker::spawn(
        settings.clone(),
        position.clone(),
        motion_ctl,
        gcode_rx,
        messages.clone(),
        WorkerConfig {
            mdi_mode: config.cli.mdi_mode,
        },
    );

    // Everything is up: greet the operator.
    messages.send(Message::Welcome);

    let ctx = CliContext {
        settings,
        fsm,
        stepgen,
        messages,
        position,
        gcode_tx,
    };

    let transport = async {
        if args.socket {
            let addr = format!("{}:{}", args.listen_ip, args.listen_port);
            socket::run(&addr, ctx, outbound, config.cli.report_inches).await
        } else {
            console::run(ctx, outbound, config.cli.report_inches).await
        }
    };

    tokio::select! {
        result = transport => {
            info!("transport closed");
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Teardown in reverse of startup: transports are gone, the worker
    // drains when its queue closes, threads are detached with the process.
    info!("shutting down");
    drop(worker);
    Ok(())
}
