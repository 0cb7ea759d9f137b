//! Simulation front-end: drives the charge controller, the auto-tuner and
//! the firmware updater against the simulated rig.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use eyre::WrapErr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trickler_config::{ChargeSettings, FileConfig, MemFlash};
use trickler_core::{ChargeClass, ChargeController, CycleOutcome, TunerState};
use trickler_hardware::{sim_rig, SimGate, SimLeds, SimMotors, SimParams, SimScale};
use trickler_traits::{Clock, Scale, TestClock};

fn init_logging(level: &str) {
    // RUST_LOG takes precedence over the CLI flag.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn load_config(path: Option<&Path>) -> eyre::Result<Option<FileConfig>> {
    let Some(path) = path else { return Ok(None) };
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading config {}", path.display()))?;
    let cfg = trickler_config::load_toml(&raw).wrap_err("parsing config")?;
    Ok(Some(cfg))
}

struct Bench {
    controller: ChargeController<SimScale, SimMotors>,
}

fn class_name(class: Option<ChargeClass>) -> &'static str {
    match class {
        Some(ChargeClass::Normal) => "normal",
        Some(ChargeClass::Under) => "under",
        Some(ChargeClass::Over) => "over",
        None => "none",
    }
}

fn build_bench(cfg: Option<&FileConfig>, target_override: Option<f32>) -> eyre::Result<Bench> {
    let mut settings = ChargeSettings::default();
    let mut params = SimParams::default();
    let mut target = 20.0f32;
    if let Some(cfg) = cfg {
        settings.coarse_stop = cfg.charge.coarse_stop;
        settings.fine_stop = cfg.charge.fine_stop;
        settings.sd_margin = cfg.charge.sd_margin;
        settings.mean_margin = cfg.charge.mean_margin;
        params = SimParams {
            coarse_flow: cfg.sim.coarse_flow,
            fine_flow: cfg.sim.fine_flow,
            sample_ms: cfg.sim.sample_ms,
        };
        target = cfg.charge.target;
    }
    if let Some(t) = target_override {
        target = t;
    }

    // Simulated time: the whole drop runs as fast as the CPU allows.
    let clock: Arc<TestClock> = Arc::new(TestClock::new());
    let clock_dyn: Arc<dyn Clock + Send + Sync> = clock;
    let (scale, motors, gate, leds): (SimScale, SimMotors, SimGate, SimLeds) =
        sim_rig(clock_dyn.clone(), params);

    let controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_gate(gate)
        .with_leds(leds)
        .with_clock(clock_dyn)
        .with_settings(settings)
        .with_target(target)
        .build()?;

    Ok(Bench { controller })
}

fn run_charge(bench: &mut Bench, cycles: u32, json: bool) -> eyre::Result<()> {
    for cycle in 1..=cycles {
        let report = bench.controller.run_cycle()?;
        match report.outcome {
            CycleOutcome::Completed => {
                let t = report
                    .telemetry
                    .as_ref()
                    .ok_or_else(|| eyre::eyre!("completed cycle without telemetry"))?;
                if json {
                    println!(
                        "{{\"cycle\":{},\"final\":{:.3},\"overthrow\":{:.3},\"elapsed_ms\":{:.0},\"class\":\"{}\"}}",
                        cycle,
                        t.final_mass,
                        t.overthrow,
                        t.total_time_ms,
                        class_name(report.classification),
                    );
                } else {
                    let dp = bench.controller.settings().decimal_places;
                    println!(
                        "cycle {cycle}: {} ({}{:.3}) in {:.1} s [{}]",
                        dp.format(t.final_mass),
                        if t.overthrow >= 0.0 { "+" } else { "" },
                        t.overthrow,
                        t.total_time_ms / 1000.0,
                        class_name(report.classification),
                    );
                }
            }
            CycleOutcome::Aborted(reason) => {
                return Err(eyre::eyre!("cycle {cycle} aborted: {reason}"));
            }
        }
    }
    Ok(())
}

fn run_tune(bench: &mut Bench, json: bool) -> eyre::Result<()> {
    bench.controller.start_tuning();
    let mut drops = 0u32;
    while bench.controller.tuner.is_active() {
        bench.controller.run_cycle()?;
        drops += 1;
        if drops > 64 {
            return Err(eyre::eyre!("tuning session did not terminate"));
        }
    }

    let state = bench.controller.tuner.state();
    let gains = bench
        .controller
        .tuner
        .recommended_gains()
        .ok_or_else(|| eyre::eyre!("tuner finished without a recommendation"))?;
    let converged = state == TunerState::Complete;
    if json {
        println!(
            "{{\"converged\":{},\"drops\":{},\"coarse_kp\":{:.3},\"coarse_kd\":{:.3},\"fine_kp\":{:.2},\"fine_kd\":{:.2}}}",
            converged,
            bench.controller.tuner.drops_completed(),
            gains.coarse_kp,
            gains.coarse_kd,
            gains.fine_kp,
            gains.fine_kd,
        );
    } else {
        println!(
            "tuning {} after {} drops",
            if converged { "complete" } else { "hit the drop budget" },
            bench.controller.tuner.drops_completed(),
        );
        println!("  coarse: Kp={:.3} Kd={:.3}", gains.coarse_kp, gains.coarse_kd);
        println!("  fine:   Kp={:.2} Kd={:.2}", gains.fine_kp, gains.fine_kd);
    }
    if converged && bench.controller.apply_tuned_gains() {
        tracing::info!("recommendation applied to the selected profile");
    }
    Ok(())
}

/// Stage a fake image into the inactive bank, verify it, activate it, and
/// show what the bootloader would do next.
fn run_fw_demo(json: bool) -> eyre::Result<()> {
    use trickler_update::{crc32, select_boot_bank, UpdateManager};

    let mut flash = MemFlash::new(0x0020_0000);
    let firmware: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let expected = crc32(&firmware);

    let mut manager = UpdateManager::new(&mut flash)?;
    manager.start_update(firmware.len() as u32, Some("demo-1.0"))?;
    for chunk in firmware.chunks(256) {
        manager.write_chunk(chunk)?;
    }
    manager.finalize_update(expected)?;
    let bank = manager.activate()?;
    drop(manager);

    let decision = select_boot_bank(&mut flash)?;
    if json {
        println!(
            "{{\"staged_bank\":\"{bank}\",\"boot_bank\":\"{}\",\"rollback\":{}}}",
            decision.bank, decision.rollback_occurred,
        );
    } else {
        println!("staged and activated bank {bank}; bootloader selects bank {}", decision.bank);
    }
    Ok(())
}

fn run_self_check(json: bool) -> eyre::Result<()> {
    let clock: Arc<dyn Clock + Send + Sync> = Arc::new(TestClock::new());
    let (mut scale, _motors, _gate, _leds) = sim_rig(clock, SimParams::default());
    let reading = scale
        .wait_next(1_000)
        .ok_or_else(|| eyre::eyre!("simulated scale produced no reading"))?;
    if json {
        println!("{{\"ok\":true,\"reading\":{reading:.3}}}");
    } else {
        println!("ok (scale reads {reading:.3})");
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Commands::Charge { grams, cycles } => {
            let mut bench = build_bench(cfg.as_ref(), grams)?;
            run_charge(&mut bench, cycles, cli.json)
        }
        Commands::Tune { grams } => {
            let mut bench = build_bench(cfg.as_ref(), grams)?;
            run_tune(&mut bench, cli.json)
        }
        Commands::FwDemo => run_fw_demo(cli.json),
        Commands::SelfCheck => run_self_check(cli.json),
    }
}
