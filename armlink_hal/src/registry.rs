//! Controller registry.
//!
//! Maps a serial port path to the single [`SharedController`] driving it.
//! Callers `acquire` a [`ControllerHandle`] and hand it back to `release`;
//! the bus behind an entry is opened on the first acquire and closed
//! exactly once, when the last handle is released or the port is
//! force-closed.
//!
//! # Locking
//!
//! The map lock is only held to look up, insert or remove entries. All
//! per-port work (bring-up, config checks, calibration hot-update and
//! teardown) runs under the entry lock. Teardown takes the map lock while
//! holding the entry lock; no path waits on an entry lock while holding
//! the map lock for an entry that is already published.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use armlink_common::calibration::{FullCalibration, MotorCalibration};
use armlink_common::config::{BusConfig, ServoIdSet, TimingConfig};
use armlink_common::consts::SERVO_IDS;
use armlink_common::protocol::Register;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bus::ServoBus;
use crate::controller::SharedController;
use crate::error::{BusError, RegistryError};
use crate::links::LinkOpener;

/// Where a new controller's calibration comes from.
#[derive(Debug, Clone)]
pub enum CalibrationSource {
    /// Supplied calibration, typically loaded from a file. Hot-applied to
    /// a live controller when it differs from the controller's current one.
    File(FullCalibration),
    /// Best-effort read of the servos' homing and limit registers, falling
    /// back to defaults per servo. Never replaces a live calibration.
    Hardware,
}

/// Reference to a shared controller, returned by
/// [`ControllerRegistry::acquire`] and consumed by
/// [`ControllerRegistry::release`].
///
/// Dropping a handle without releasing it keeps the port open until
/// [`ControllerRegistry::force_close`].
#[must_use = "an unreleased handle keeps the port open"]
pub struct ControllerHandle {
    port: String,
    token: u64,
    servo_ids: ServoIdSet,
    controller: Arc<SharedController>,
}

impl ControllerHandle {
    /// Port this handle was acquired for.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Servo subset requested in the acquiring [`BusConfig`].
    pub fn servo_ids(&self) -> &[u8] {
        &self.servo_ids
    }

    /// Shared controller.
    pub fn controller(&self) -> &Arc<SharedController> {
        &self.controller
    }
}

impl Deref for ControllerHandle {
    type Target = SharedController;

    fn deref(&self) -> &SharedController {
        &self.controller
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("port", &self.port)
            .field("token", &self.token)
            .field("servo_ids", &self.servo_ids)
            .finish()
    }
}

/// Read-only snapshot of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    /// Device path.
    pub port: String,
    /// Live handles.
    pub ref_count: i64,
    /// False when bring-up failed and the failure is cached.
    pub healthy: bool,
    /// Settings the controller was opened with.
    pub config: Option<BusConfig>,
    /// Cached bring-up failure.
    pub last_error: Option<String>,
}

struct ControllerEntry {
    controller: Option<Arc<SharedController>>,
    config: Option<BusConfig>,
    ref_count: AtomicI64,
    last_error: Option<String>,
    tokens: HashSet<u64>,
    /// Set once the entry has been torn down and unpublished.
    retired: bool,
}

impl ControllerEntry {
    fn new(config: &BusConfig) -> Self {
        Self {
            controller: None,
            config: Some(config.clone()),
            ref_count: AtomicI64::new(0),
            last_error: None,
            tokens: HashSet::new(),
            retired: false,
        }
    }

    fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Close the bus and clear the entry. Close failures are logged only.
    fn tear_down(&mut self, port: &str) {
        self.retired = true;
        self.tokens.clear();
        self.ref_count.store(0, Ordering::Release);
        if let Some(controller) = self.controller.take() {
            if let Err(e) = controller.bus().close() {
                error!("Failed to close bus on {}: {}", port, e);
            }
        }
        self.config = None;
    }
}

/// Process-wide map from port path to shared controller.
///
/// Constructed once and injected into every component that drives an arm.
pub struct ControllerRegistry {
    entries: RwLock<HashMap<String, Arc<Mutex<ControllerEntry>>>>,
    opener: Arc<dyn LinkOpener>,
    timing: TimingConfig,
    next_token: AtomicU64,
}

impl ControllerRegistry {
    /// Registry opening links with `opener` and driving buses with `timing`.
    pub fn new(opener: Arc<dyn LinkOpener>, timing: TimingConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            opener,
            timing,
            next_token: AtomicU64::new(1),
        }
    }

    /// Get the controller for `config.port`, opening it on first use.
    ///
    /// # Errors
    ///
    /// - `ConfigConflict` if the port is live with another baudrate or
    ///   timeout; the live entry is left untouched
    /// - `BringUpFailed` if an earlier bring-up on this port failed
    /// - `Config` / `Calibration` when the request itself is invalid
    /// - `Bus` when the port cannot be opened
    pub fn acquire(
        &self,
        config: &BusConfig,
        source: CalibrationSource,
    ) -> Result<ControllerHandle, RegistryError> {
        loop {
            let existing = self.entries.read().get(&config.port).cloned();
            match existing {
                Some(entry) => {
                    if let Some(handle) = self.join(&entry, config, &source)? {
                        return Ok(handle);
                    }
                    // Entry retired between lookup and lock.
                }
                None => {
                    if let Some(handle) = self.create(config, &source)? {
                        return Ok(handle);
                    }
                }
            }
        }
    }

    /// Join an existing entry. `None` if it was retired meanwhile.
    fn join(
        &self,
        entry: &Arc<Mutex<ControllerEntry>>,
        config: &BusConfig,
        source: &CalibrationSource,
    ) -> Result<Option<ControllerHandle>, RegistryError> {
        let mut guard = entry.lock();
        if guard.retired {
            return Ok(None);
        }
        let Some(controller) = guard.controller.clone() else {
            return Err(RegistryError::BringUpFailed {
                port: config.port.clone(),
                reason: guard
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            });
        };
        if let Some(existing) = guard.config.as_ref() {
            if !existing.is_compatible(config) {
                let ref_count = guard.ref_count();
                warn!(
                    port = %config.port,
                    ref_count, "Rejected conflicting controller request"
                );
                return Err(RegistryError::ConfigConflict {
                    port: config.port.clone(),
                    existing: describe(existing),
                    requested: describe(config),
                    ref_count,
                });
            }
        }
        if let CalibrationSource::File(calibration) = source {
            // Any handle or workflow may have replaced the live calibration.
            if controller.get_calibration() != *calibration {
                controller.set_calibration(calibration.clone())?;
                if let Err(e) = controller.write_calibration_to_bus() {
                    warn!(
                        "Calibration for {} applied in software only: {}",
                        config.port, e
                    );
                }
                info!("Hot-updated calibration on {}", config.port);
            }
        }
        let handle = self.issue(&mut guard, config, controller);
        debug!(
            port = %config.port,
            ref_count = guard.ref_count(),
            "Controller shared"
        );
        Ok(Some(handle))
    }

    /// Create and publish a new entry. `None` if another caller created one
    /// first.
    fn create(
        &self,
        config: &BusConfig,
        source: &CalibrationSource,
    ) -> Result<Option<ControllerHandle>, RegistryError> {
        config.validate()?;
        if let CalibrationSource::File(calibration) = source {
            calibration.validate()?;
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&config.port) {
            return Ok(None);
        }
        let entry = Arc::new(Mutex::new(ControllerEntry::new(config)));
        let mut guard = entry.lock();
        entries.insert(config.port.clone(), Arc::clone(&entry));
        drop(entries);

        let bus = match self.opener.open(config) {
            Ok(link) => Arc::new(ServoBus::new(link, config.clone(), self.timing)),
            Err(e) => {
                error!("Controller bring-up on {} failed: {}", config.port, e);
                guard.last_error = Some(e.to_string());
                return Err(RegistryError::Bus(e));
            }
        };
        let calibration = match source {
            CalibrationSource::File(calibration) => calibration.clone(),
            CalibrationSource::Hardware => read_hardware_calibration(&bus),
        };
        let controller = Arc::new(SharedController::new(bus, calibration));
        guard.controller = Some(Arc::clone(&controller));
        let handle = self.issue(&mut guard, config, controller);
        info!(
            "Controller created on {} at {} baud",
            config.port, config.baudrate
        );
        Ok(Some(handle))
    }

    fn issue(
        &self,
        entry: &mut ControllerEntry,
        config: &BusConfig,
        controller: Arc<SharedController>,
    ) -> ControllerHandle {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entry.tokens.insert(token);
        entry.ref_count.fetch_add(1, Ordering::AcqRel);
        ControllerHandle {
            port: config.port.clone(),
            token,
            servo_ids: config.servo_ids.clone(),
            controller,
        }
    }

    /// Return a handle. The last release closes the bus and removes the
    /// entry.
    ///
    /// # Errors
    /// `StaleHandle` if the entry was force-closed after the handle was
    /// issued.
    pub fn release(&self, handle: ControllerHandle) -> Result<(), RegistryError> {
        let stale = || RegistryError::StaleHandle {
            port: handle.port.clone(),
        };
        let entry = self.entries.read().get(&handle.port).cloned().ok_or_else(stale)?;
        let mut guard = entry.lock();
        if guard.retired || !guard.tokens.remove(&handle.token) {
            return Err(stale());
        }
        let remaining = guard.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            debug!(port = %handle.port, ref_count = remaining, "Controller released");
            return Ok(());
        }

        guard.tear_down(&handle.port);
        let mut entries = self.entries.write();
        if entries
            .get(&handle.port)
            .is_some_and(|current| Arc::ptr_eq(current, &entry))
        {
            entries.remove(&handle.port);
        }
        info!("Controller on {} closed after last release", handle.port);
        Ok(())
    }

    /// Remove and close a port's entry regardless of outstanding handles.
    /// Also clears a cached bring-up failure. Returns false if the port had
    /// no entry.
    pub fn force_close(&self, port: &str) -> bool {
        let Some(entry) = self.entries.write().remove(port) else {
            return false;
        };
        let mut guard = entry.lock();
        let ref_count = guard.ref_count();
        guard.tear_down(port);
        warn!(port, ref_count, "Controller force-closed");
        true
    }

    /// Force-close every entry.
    pub fn close_all(&self) {
        for port in self.ports() {
            self.force_close(&port);
        }
    }

    /// Snapshot of a port's entry, `None` if the port has none.
    pub fn status(&self, port: &str) -> Option<ControllerStatus> {
        let entry = self.entries.read().get(port).cloned()?;
        let guard = entry.lock();
        if guard.retired {
            return None;
        }
        Some(ControllerStatus {
            port: port.to_string(),
            ref_count: guard.ref_count(),
            healthy: guard.controller.is_some(),
            config: guard.config.clone(),
            last_error: guard.last_error.clone(),
        })
    }

    /// Ports with an entry, sorted.
    pub fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.entries.read().keys().cloned().collect();
        ports.sort();
        ports
    }
}

impl Drop for ControllerRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn describe(config: &BusConfig) -> String {
    format!("{} baud, {} ms timeout", config.baudrate, config.timeout_ms)
}

/// Seed a calibration from the servos' own registers. Servos that do not
/// answer, or report unusable values, get the default record.
fn read_hardware_calibration(bus: &ServoBus) -> FullCalibration {
    let motors = SERVO_IDS.map(|id| match read_motor(bus, id) {
        Ok(motor) => match motor.validate_for_arm() {
            Ok(()) => motor,
            Err(e) => {
                warn!("Servo {} registers unusable, using default: {}", id, e);
                MotorCalibration::default_for(id)
            }
        },
        Err(e) => {
            warn!("Servo {} calibration read failed, using default: {}", id, e);
            MotorCalibration::default_for(id)
        }
    });
    FullCalibration::new(motors).unwrap_or_else(|e| {
        warn!("Hardware calibration rejected, using defaults: {}", e);
        FullCalibration::default()
    })
}

fn read_motor(bus: &ServoBus, id: u8) -> Result<MotorCalibration, BusError> {
    let homing_offset = bus.read_register(id, Register::HomingOffset)?;
    let range_min = bus.read_register(id, Register::MinPositionLimit)?;
    let range_max = bus.read_register(id, Register::MaxPositionLimit)?;
    let mut motor = MotorCalibration::default_for(id);
    motor.homing_offset = homing_offset;
    motor.range_min = range_min.clamp(0, u16::MAX as i32) as u16;
    motor.range_max = range_max.clamp(0, u16::MAX as i32) as u16;
    Ok(motor)
}
