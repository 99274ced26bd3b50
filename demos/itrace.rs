use std::process::Command;
use std::sync::Arc;

use anyhow::Result;
use itrace::{Arch, Engine, Probe, ProbeState, Ptracer, StepMode};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Report once per basic block instead of once per instruction.
    #[structopt(short, long)]
    block: bool,

    /// Require stepping over PowerPC atomic sequences, as done by default on PowerPC
    /// hosts. Refused on other hosts.
    #[structopt(long)]
    powerpc: bool,

    /// Only print the final count.
    #[structopt(short, long)]
    quiet: bool,

    #[structopt(min_values = 1)]
    argv: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();
    let arch = tracee_arch(opt.powerpc, Arch::host())?;

    let mut cmd = Command::new(&opt.argv[0]);

    if let Some(args) = opt.argv.get(1..) {
        cmd.args(args);
    }

    let mode = if opt.block { StepMode::Block } else { StepMode::Instruction };

    let mut engine = Engine::new(Ptracer::new());
    engine.set_arch(arch);

    let quiet = opt.quiet;
    let probe = Arc::new(Probe::new("itrace", move |ctx| {
        ctx.charge(1)?;

        if !quiet {
            let kind = match ctx.state() {
                ProbeState::Instruction { .. } => "insn",
                ProbeState::Block { .. } => "block",
            };
            println!("{:>16x} {}", ctx.regs().pc, kind);
        }

        Ok(())
    }));

    let mut child = engine.backend().spawn(cmd)?;

    // Tracee is in its post-exec stop.
    let tracee = match engine.backend().wait()? {
        Some(tracee) => tracee,
        None => anyhow::bail!("tracee exited before its first stop"),
    };

    engine.begin_trace(tracee.pid(), mode, probe.clone())?;
    engine.backend().restart(tracee, engine.backend().passthrough(&tracee))?;
    engine.run()?;

    let status = child.wait()?;

    eprintln!("{} probe hits, {} errors, {}", probe.hits(), probe.errors(), status);

    Ok(())
}

// Traced processes run natively, so PowerPC handling would patch PowerPC traps into
// foreign text anywhere else.
fn tracee_arch(powerpc: bool, host: Arch) -> Result<Arch> {
    if powerpc && host != Arch::PowerPc {
        anyhow::bail!("--powerpc requires a PowerPC host");
    }

    Ok(host)
}
