//! Motor command queue and executor task.
//!
//! The control path is the only writer; the motor task is the only
//! executor. The queue is small and sheds the *oldest* pending command
//! under backpressure, because motor authority is the latest requested
//! speed, not the history of requests.

use crossbeam_channel as xch;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trickler_traits::{HwResult, MotorDrive, MotorId};

const QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotorCommand {
    SetSpeed(MotorId, f32),
    Enable(MotorId, bool),
}

/// Control-side handle; implements `MotorDrive` so the charge controller
/// can be wired to it unchanged.
pub struct MotorQueue {
    tx: xch::Sender<MotorCommand>,
    shed: xch::Receiver<MotorCommand>,
    fault: Arc<AtomicBool>,
    coarse_bounds: (f32, f32),
    fine_bounds: (f32, f32),
}

pub struct MotorTask {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MotorQueue {
    fn push(&self, cmd: MotorCommand) {
        let mut pending = cmd;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(xch::TrySendError::Full(c)) => {
                    let _ = self.shed.try_recv();
                    pending = c;
                }
                Err(xch::TrySendError::Disconnected(_)) => {
                    self.fault.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

impl MotorDrive for MotorQueue {
    fn set_speed(&mut self, motor: MotorId, rps: f32) -> HwResult<()> {
        // A fault reported by the executor surfaces on the next command,
        // which the control task treats as fatal for the drop.
        if self.fault.load(Ordering::Relaxed) {
            return Err("motor task fault".into());
        }
        self.push(MotorCommand::SetSpeed(motor, rps));
        Ok(())
    }

    fn enable(&mut self, motor: MotorId, enabled: bool) -> HwResult<()> {
        if self.fault.load(Ordering::Relaxed) {
            return Err("motor task fault".into());
        }
        self.push(MotorCommand::Enable(motor, enabled));
        Ok(())
    }

    fn min_speed(&self, motor: MotorId) -> f32 {
        match motor {
            MotorId::Coarse => self.coarse_bounds.0,
            MotorId::Fine => self.fine_bounds.0,
        }
    }

    fn max_speed(&self, motor: MotorId) -> f32 {
        match motor {
            MotorId::Coarse => self.coarse_bounds.1,
            MotorId::Fine => self.fine_bounds.1,
        }
    }
}

impl MotorTask {
    /// Move the real drive into its executor thread and hand back the
    /// queue-backed stand-in.
    pub fn spawn<M>(mut motors: M) -> (MotorQueue, MotorTask)
    where
        M: MotorDrive + Send + 'static,
    {
        let (tx, rx) = xch::bounded::<MotorCommand>(QUEUE_DEPTH);
        let shed = rx.clone();
        let fault = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let coarse_bounds = (motors.min_speed(MotorId::Coarse), motors.max_speed(MotorId::Coarse));
        let fine_bounds = (motors.min_speed(MotorId::Fine), motors.max_speed(MotorId::Fine));

        let task_fault = fault.clone();
        let task_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            while !task_stop.load(Ordering::Relaxed) {
                let cmd = match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(c) => c,
                    Err(xch::RecvTimeoutError::Timeout) => continue,
                    Err(xch::RecvTimeoutError::Disconnected) => break,
                };
                let result = match cmd {
                    MotorCommand::SetSpeed(motor, rps) => motors.set_speed(motor, rps),
                    MotorCommand::Enable(motor, enabled) => motors.enable(motor, enabled),
                };
                if let Err(e) = result {
                    tracing::error!(error = %e, "motor command failed");
                    task_fault.store(true, Ordering::Relaxed);
                }
            }
            // Leave the hardware de-energized on the way out.
            let _ = motors.set_speed(MotorId::Coarse, 0.0);
            let _ = motors.set_speed(MotorId::Fine, 0.0);
        });

        (
            MotorQueue {
                tx,
                shed,
                fault,
                coarse_bounds,
                fine_bounds,
            },
            MotorTask {
                stop,
                handle: Some(handle),
            },
        )
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for MotorTask {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::SpyMotors;

    #[test]
    fn commands_reach_the_drive() {
        let (motors, handle) = SpyMotors::new();
        let (mut queue, task) = MotorTask::spawn(motors);
        queue.set_speed(MotorId::Coarse, 1.5).unwrap();
        queue.set_speed(MotorId::Coarse, 0.0).unwrap();
        // Give the executor a moment to drain.
        for _ in 0..50 {
            if handle.commands().len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        task.shutdown();
        let cmds = handle.commands();
        assert!(cmds.contains(&(MotorId::Coarse, 1.5)));
    }

    #[test]
    fn backpressure_drops_oldest_not_newest() {
        let (motors, _handle) = SpyMotors::new();
        // Spawn the task but immediately stop it so the queue fills.
        let (mut queue, task) = MotorTask::spawn(motors);
        task.shutdown();
        for i in 0..40 {
            let _ = queue.set_speed(MotorId::Fine, i as f32);
        }
        // The freshest command is still in the queue.
        let mut latest = None;
        while let Ok(cmd) = queue.shed.try_recv() {
            latest = Some(cmd);
        }
        assert_eq!(latest, Some(MotorCommand::SetSpeed(MotorId::Fine, 39.0)));
    }
}
