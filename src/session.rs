//! Synchronization controller.
//!
//! Drives a primary/secondary camera pair through
//! `Created -> Initialized -> ConfiguredSetup -> Armed -> Capturing -> Stopped`.
//! Teardown always runs: [`AcquisitionSession::run`] calls it on every path,
//! and [`DeviceHandle`] releases anything still held when dropped.

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::{CaptureLoop, CaptureMode, CaptureSummary, StopSignal};
use crate::config::{CameraConfig, RigConfig};
use crate::configurator::Configurator;
use crate::error::{DeviceTeardownError, SessionError, TeardownErrors, TeardownStep};
use crate::sink::VideoSink;
use crate::traits::{Camera, Role};
use crate::validation::check_stream_balance;

/// Largest written-frame difference between the streams that is not reported.
pub const STREAM_DRIFT_TOLERANCE: u64 = 1;

/// Lifecycle state of an [`AcquisitionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Devices handed over, nothing done yet.
    Created,
    /// Both devices opened.
    Initialized,
    /// Both devices configured, triggering still inert.
    ConfiguredSetup,
    /// Both devices acquiring.
    Armed,
    /// The capture loop ran or is running.
    Capturing,
    /// Devices released.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::ConfiguredSetup => "configured",
            Self::Armed => "armed",
            Self::Capturing => "capturing",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One camera owned by a session, with the resources it currently holds.
pub struct DeviceHandle<C: Camera> {
    camera: C,
    role: Role,
    serial: String,
    initialized: bool,
    acquiring: bool,
}

impl<C: Camera> DeviceHandle<C> {
    /// Take ownership of `camera` in `role`.
    pub fn new(camera: C, role: Role) -> Self {
        let serial = camera.serial_number().to_owned();
        Self {
            camera,
            role,
            serial,
            initialized: false,
            acquiring: false,
        }
    }

    /// Role in the trigger chain.
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Serial number of the device.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Whether the device is open.
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether acquisition is running.
    pub const fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// The wrapped camera.
    pub const fn camera(&self) -> &C {
        &self.camera
    }

    fn init(&mut self) -> Result<(), SessionError> {
        self.camera.init().map_err(|source| self.device_error(source))?;
        self.initialized = true;
        info!(serial = %self.serial, role = %self.role, "camera initialized");
        Ok(())
    }

    fn begin_acquisition(&mut self) -> Result<(), SessionError> {
        self.camera
            .begin_acquisition()
            .map_err(|source| self.device_error(source))?;
        self.acquiring = true;
        info!(serial = %self.serial, role = %self.role, "acquisition started");
        Ok(())
    }

    fn configurator(&mut self) -> Configurator<'_, C::Nodes> {
        Configurator::new(self.camera.node_map(), &self.serial)
    }

    fn device_error(&self, source: crate::error::CameraError) -> SessionError {
        SessionError::Device {
            serial: self.serial.clone(),
            source,
        }
    }

    /// Stop acquisition and release the device, skipping whatever is not held.
    ///
    /// Every step is attempted once; failures are collected, not retried.
    pub fn teardown(&mut self) -> Vec<DeviceTeardownError> {
        let mut errors = Vec::new();
        if self.acquiring {
            self.acquiring = false;
            match self.camera.end_acquisition() {
                Ok(()) => info!(serial = %self.serial, role = %self.role, "acquisition stopped"),
                Err(source) => errors.push(DeviceTeardownError {
                    serial: self.serial.clone(),
                    step: TeardownStep::EndAcquisition,
                    source,
                }),
            }
        }
        if self.initialized {
            self.initialized = false;
            match self.camera.deinit() {
                Ok(()) => info!(serial = %self.serial, role = %self.role, "camera released"),
                Err(source) => errors.push(DeviceTeardownError {
                    serial: self.serial.clone(),
                    step: TeardownStep::Release,
                    source,
                }),
            }
        }
        errors
    }
}

impl<C: Camera> Drop for DeviceHandle<C> {
    fn drop(&mut self) {
        if self.initialized || self.acquiring {
            warn!(serial = %self.serial, "device dropped without teardown, releasing");
            for err in self.teardown() {
                warn!(error = %err, "teardown on drop failed");
            }
        }
    }
}

/// Everything a session needs besides the devices.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPlan {
    /// Settings for the trigger source.
    pub primary: CameraConfig,
    /// Settings for the trigger sink.
    pub secondary: CameraConfig,
    /// Capture duration.
    pub duration: Duration,
    /// Per-retrieval timeout.
    pub frame_timeout: Duration,
    /// User set loaded before configuration, if any.
    pub user_set: Option<String>,
    /// Disable triggering on the primary once both devices are armed.
    pub primary_free_run: bool,
    /// Capture loop strategy.
    pub capture_mode: CaptureMode,
}

impl SessionPlan {
    /// Build the plan described by a loaded configuration.
    pub fn from_config(config: &RigConfig) -> Self {
        let session = &config.session;
        let user_set = session.user_set.trim();
        Self {
            primary: config.camera_config(Role::Primary),
            secondary: config.camera_config(Role::Secondary),
            duration: Duration::try_from_secs_f64(session.duration_seconds)
                .unwrap_or(Duration::ZERO),
            frame_timeout: Duration::from_millis(session.frame_timeout_ms),
            user_set: (!user_set.is_empty()).then(|| user_set.to_owned()),
            primary_free_run: session.primary_free_run,
            capture_mode: session.capture_mode,
        }
    }

    /// Reject plans that cannot describe a valid session.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.primary.role() != Role::Primary {
            return Err(SessionError::Plan(
                "primary camera has secondary trigger wiring".to_owned(),
            ));
        }
        if self.secondary.role() != Role::Secondary {
            return Err(SessionError::Plan(
                "secondary camera has primary trigger wiring".to_owned(),
            ));
        }
        if self.duration.is_zero() {
            return Err(SessionError::Plan("capture duration must be positive".to_owned()));
        }
        if self.frame_timeout.is_zero() {
            return Err(SessionError::Plan("frame timeout must be positive".to_owned()));
        }
        Ok(())
    }
}

/// A primary/secondary pair recorded together.
pub struct AcquisitionSession<P: Camera, S: Camera> {
    plan: SessionPlan,
    primary: DeviceHandle<P>,
    secondary: DeviceHandle<S>,
    state: SessionState,
    stop: StopSignal,
}

impl<P: Camera, S: Camera> AcquisitionSession<P, S> {
    /// Pair two cameras under `plan`.
    pub fn new(primary: P, secondary: S, plan: SessionPlan) -> Result<Self, SessionError> {
        plan.validate()?;
        Ok(Self {
            plan,
            primary: DeviceHandle::new(primary, Role::Primary),
            secondary: DeviceHandle::new(secondary, Role::Secondary),
            state: SessionState::Created,
            stop: StopSignal::new(),
        })
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Plan the session runs.
    pub const fn plan(&self) -> &SessionPlan {
        &self.plan
    }

    /// Primary device.
    pub const fn primary(&self) -> &DeviceHandle<P> {
        &self.primary
    }

    /// Secondary device.
    pub const fn secondary(&self) -> &DeviceHandle<S> {
        &self.secondary
    }

    /// Signal that ends the capture early when triggered from another thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "session state changed");
        self.state = next;
    }

    /// Open both devices.
    pub fn initialize(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;
        self.primary.init()?;
        self.secondary.init()?;
        self.transition(SessionState::Initialized);
        Ok(())
    }

    /// Reset both devices to the user set, then apply their settings.
    ///
    /// The primary is configured first; it does not emit triggers until it
    /// acquires, so the secondary's wiring is programmed while inert.
    pub fn configure(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Initialized)?;
        let user_set = self.plan.user_set.as_deref();

        let mut primary = self.primary.configurator();
        if let Some(name) = user_set {
            primary.load_user_set(name);
        }
        primary.apply(&self.plan.primary)?;
        info!(serial = %self.primary.serial, role = %Role::Primary, "camera configured");

        let mut secondary = self.secondary.configurator();
        if let Some(name) = user_set {
            secondary.load_user_set(name);
        }
        secondary.apply(&self.plan.secondary)?;
        info!(serial = %self.secondary.serial, role = %Role::Secondary, "camera configured");

        self.transition(SessionState::ConfiguredSetup);
        Ok(())
    }

    /// Start acquisition, consumer before producer.
    ///
    /// With `primary_free_run` set, triggering is then disabled on the
    /// primary so it runs on its own frame clock.
    pub fn arm(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::ConfiguredSetup)?;
        self.secondary.begin_acquisition()?;
        self.primary.begin_acquisition()?;
        if self.plan.primary_free_run {
            self.primary.configurator().disable_trigger()?;
            info!(serial = %self.primary.serial, "primary free-running");
        }
        self.transition(SessionState::Armed);
        Ok(())
    }

    /// Run the capture loop into the two sinks.
    pub fn capture<L, R>(&mut self, left: &mut L, right: &mut R) -> Result<CaptureSummary, SessionError>
    where
        P: Send,
        S: Send,
        L: VideoSink + Send,
        R: VideoSink + Send,
    {
        self.expect_state(SessionState::Armed)?;
        self.transition(SessionState::Capturing);

        let capture = CaptureLoop::new(self.plan.duration)
            .with_frame_timeout(self.plan.frame_timeout)
            .with_stop_signal(self.stop.clone());
        let primary = &mut self.primary.camera;
        let secondary = &mut self.secondary.camera;
        let summary = match self.plan.capture_mode {
            CaptureMode::Sequential => {
                capture.run_with(primary, secondary, left, right, |record| {
                    debug!(
                        cycle = record.cycle,
                        elapsed = ?record.elapsed,
                        skew = ?record.timestamp_skew(),
                        "cycle complete"
                    );
                })?
            }
            CaptureMode::Concurrent => capture.run_concurrent(primary, secondary, left, right)?,
        };

        if let Err(err) = check_stream_balance(&summary, STREAM_DRIFT_TOLERANCE) {
            warn!(error = %err, "stream drift");
        }
        Ok(summary)
    }

    /// Release both devices, secondary first.
    ///
    /// Runs every step even when earlier ones fail. Calling it again is a
    /// no-op.
    pub fn teardown(&mut self) -> Result<(), TeardownErrors> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        let mut errors = self.secondary.teardown();
        errors.extend(self.primary.teardown());
        self.transition(SessionState::Stopped);

        if errors.is_empty() {
            info!("session stopped");
            Ok(())
        } else {
            Err(TeardownErrors(errors))
        }
    }

    /// Run the whole session and finish both sinks.
    ///
    /// Sinks are finished and devices released whatever happens. A failure
    /// before or during capture is returned in preference to a later
    /// cleanup failure, which is then only logged.
    pub fn run<L, R>(&mut self, left: &mut L, right: &mut R) -> Result<CaptureSummary, SessionError>
    where
        P: Send,
        S: Send,
        L: VideoSink + Send,
        R: VideoSink + Send,
    {
        let outcome = self.prepare_and_capture(left, right);
        let finished = left.finish().and_then(|_| right.finish());
        let released = self.teardown();

        match outcome {
            Ok(summary) => {
                finished?;
                released?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(sink_err) = finished {
                    error!(error = %sink_err, "finishing sinks failed");
                }
                if let Err(teardown_err) = released {
                    error!(error = %teardown_err, "teardown failed");
                }
                Err(err)
            }
        }
    }

    fn prepare_and_capture<L, R>(
        &mut self,
        left: &mut L,
        right: &mut R,
    ) -> Result<CaptureSummary, SessionError>
    where
        P: Send,
        S: Send,
        L: VideoSink + Send,
        R: VideoSink + Send,
    {
        self.initialize()?;
        self.configure()?;
        self.arm()?;
        self.capture(left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurator::nodes;
    use crate::error::CameraError;
    use crate::mock::{EventLog, MemorySink, MockCamera, MockFailure, MockNodeMap};

    const CONFIG: &str = include_str!("../config/camera_config.toml");

    fn plan() -> SessionPlan {
        let config = RigConfig::from_toml(CONFIG).expect("sample config should parse");
        let mut plan = SessionPlan::from_config(&config);
        plan.primary.geometry.width = 64;
        plan.primary.geometry.height = 32;
        plan.secondary.geometry = plan.primary.geometry;
        plan.duration = Duration::from_millis(100);
        plan
    }

    #[test]
    fn test_plan_from_sample_config() {
        let config = RigConfig::from_toml(CONFIG).expect("sample config should parse");
        let plan = SessionPlan::from_config(&config);
        assert_eq!(plan.primary.role(), Role::Primary);
        assert_eq!(plan.secondary.role(), Role::Secondary);
        assert_eq!(plan.duration, Duration::from_secs(1));
        assert_eq!(plan.frame_timeout, Duration::from_millis(1000));
        assert_eq!(plan.user_set.as_deref(), Some("Default"));
        assert!(plan.primary_free_run);
    }

    #[test]
    fn test_plan_rejects_swapped_roles() {
        let mut plan = plan();
        std::mem::swap(&mut plan.primary, &mut plan.secondary);
        let err = AcquisitionSession::new(MockCamera::new("P1"), MockCamera::new("S1"), plan)
            .err()
            .expect("swapped roles must be rejected");
        assert!(matches!(err, SessionError::Plan(_)));
    }

    #[test]
    fn test_full_run_reaches_stopped() {
        let primary = MockCamera::new("P1");
        let secondary = MockCamera::new("S1");
        let (primary_counts, secondary_counts) = (primary.counts(), secondary.counts());
        let mut session =
            AcquisitionSession::new(primary, secondary, plan()).expect("plan should be valid");
        let mut left = MemorySink::new();
        let mut right = MemorySink::new();

        let summary = session.run(&mut left, &mut right).expect("session should succeed");

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(summary.cycles > 0);
        assert_eq!(left.frames_written(), summary.left.written);
        assert_eq!(right.frames_written(), summary.right.written);
        assert!(left.is_finished() && right.is_finished());
        for counts in [primary_counts, secondary_counts] {
            assert_eq!(counts.begins(), 1);
            assert_eq!(counts.ends(), 1);
            assert_eq!(counts.deinits(), 1);
            assert_eq!(counts.releases(), counts.images());
        }
    }

    #[test]
    fn test_arm_order_and_primary_free_run() {
        let events = EventLog::new();
        let primary = MockCamera::new("P1").with_event_log(events.clone());
        let secondary = MockCamera::new("S1").with_event_log(events.clone());
        let mut session =
            AcquisitionSession::new(primary, secondary, plan()).expect("plan should be valid");

        session.initialize().expect("initialize");
        session.configure().expect("configure");
        session.arm().expect("arm");
        assert_eq!(session.state(), SessionState::Armed);

        let secondary_begin = events.position("S1 begin_acquisition").expect("secondary began");
        let primary_begin = events.position("P1 begin_acquisition").expect("primary began");
        assert!(secondary_begin < primary_begin);

        let log = events.events();
        let last = log.last().expect("events recorded");
        assert_eq!(last, "P1 write TriggerMode=Off");

        // The secondary's trigger wiring is in place before anything acquires.
        let wiring = events
            .position("S1 write TriggerSource=Line3")
            .expect("secondary wired");
        assert!(wiring < secondary_begin);
        session.teardown().expect("teardown");
    }

    #[test]
    fn test_triggered_primary_keeps_trigger_mode() {
        let events = EventLog::new();
        let primary = MockCamera::new("P1").with_event_log(events.clone());
        let mut plan = plan();
        plan.primary_free_run = false;
        let mut session = AcquisitionSession::new(primary, MockCamera::new("S1"), plan)
            .expect("plan should be valid");

        session.initialize().expect("initialize");
        session.configure().expect("configure");
        session.arm().expect("arm");
        let begin = events.position("P1 begin_acquisition").expect("primary began");
        assert!(events
            .events()
            .iter()
            .skip(begin)
            .all(|e| !e.contains("TriggerMode")));
        session.teardown().expect("teardown");
    }

    #[test]
    fn test_teardown_once_when_secondary_configuration_fails() {
        let primary = MockCamera::new("P1");
        let secondary = MockCamera::new("S1")
            .with_node_map(MockNodeMap::new().reject_writes_to(nodes::TRIGGER_SOURCE));
        let (primary_counts, secondary_counts) = (primary.counts(), secondary.counts());
        let mut session =
            AcquisitionSession::new(primary, secondary, plan()).expect("plan should be valid");
        let mut left = MemorySink::new();
        let mut right = MemorySink::new();

        let err = session
            .run(&mut left, &mut right)
            .expect_err("secondary configuration must fail");
        assert!(
            matches!(&err, SessionError::Configuration(cause)
                if cause.serial == "S1" && cause.property == nodes::TRIGGER_SOURCE),
            "unexpected error: {err}"
        );

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(primary_counts.deinits(), 1);
        assert_eq!(secondary_counts.deinits(), 1);
        // Acquisition never started, so it is never stopped.
        assert_eq!(primary_counts.begins(), 0);
        assert_eq!(primary_counts.ends(), 0);

        session.teardown().expect("second teardown is a no-op");
        drop(session);
        assert_eq!(primary_counts.deinits(), 1);
        assert_eq!(secondary_counts.deinits(), 1);
        assert_eq!(left.frames_written(), 0);
    }

    #[test]
    fn test_capture_rejected_unless_armed() {
        let mut session = AcquisitionSession::new(MockCamera::new("P1"), MockCamera::new("S1"), plan())
            .expect("plan should be valid");
        let err = session
            .capture(&mut MemorySink::new(), &mut MemorySink::new())
            .expect_err("capture before arm must fail");
        assert!(matches!(
            err,
            SessionError::InvalidState {
                expected: SessionState::Armed,
                actual: SessionState::Created,
            }
        ));

        let err = session.arm().expect_err("arm before configure must fail");
        assert!(matches!(err, SessionError::InvalidState { .. }));
    }

    #[test]
    fn test_teardown_errors_are_collected() {
        let primary = MockCamera::new("P1").failing(MockFailure::EndAcquisition);
        let secondary = MockCamera::new("S1").failing(MockFailure::Deinit);
        let primary_counts = primary.counts();
        let mut session =
            AcquisitionSession::new(primary, secondary, plan()).expect("plan should be valid");

        let err = session
            .run(&mut MemorySink::new(), &mut MemorySink::new())
            .expect_err("teardown failures must be reported");
        assert!(matches!(err, SessionError::Teardown(_)), "unexpected error: {err}");
        let errors = match err {
            SessionError::Teardown(TeardownErrors(errors)) => errors,
            _ => Vec::new(),
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].serial, "S1");
        assert_eq!(errors[0].step, TeardownStep::Release);
        assert_eq!(errors[1].serial, "P1");
        assert_eq!(errors[1].step, TeardownStep::EndAcquisition);
        // The primary's release still ran after its end step failed.
        assert_eq!(primary_counts.deinits(), 1);
    }

    #[test]
    fn test_capture_failure_wins_over_teardown_failure() {
        let primary = MockCamera::new("P1")
            .failing(MockFailure::NextImage)
            .failing(MockFailure::Deinit);
        let mut session = AcquisitionSession::new(primary, MockCamera::new("S1"), plan())
            .expect("plan should be valid");
        let mut left = MemorySink::new();

        let err = session
            .run(&mut left, &mut MemorySink::new())
            .expect_err("capture must fail");
        assert!(matches!(
            err,
            SessionError::Capture(crate::error::CaptureError::Device {
                source: CameraError::Acquisition(_),
                ..
            })
        ));
        assert!(left.is_finished());
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_drop_releases_held_devices() {
        let primary = MockCamera::new("P1");
        let counts = primary.counts();
        let mut session = AcquisitionSession::new(primary, MockCamera::new("S1"), plan())
            .expect("plan should be valid");
        session.initialize().expect("initialize");
        session.configure().expect("configure");
        session.arm().expect("arm");
        drop(session);
        assert_eq!(counts.ends(), 1);
        assert_eq!(counts.deinits(), 1);
    }

    #[test]
    fn test_stop_signal_ends_capture_early() {
        let mut plan = plan();
        plan.duration = Duration::from_secs(3600);
        let mut session = AcquisitionSession::new(MockCamera::new("P1"), MockCamera::new("S1"), plan)
            .expect("plan should be valid");
        session.stop_signal().trigger();

        let summary = session
            .run(&mut MemorySink::new(), &mut MemorySink::new())
            .expect("cancelled session still succeeds");
        assert!(summary.cancelled);
        assert_eq!(summary.cycles, 0);
    }

    #[test]
    fn test_concurrent_mode() {
        let mut plan = plan();
        plan.capture_mode = CaptureMode::Concurrent;
        let mut session = AcquisitionSession::new(MockCamera::new("P1"), MockCamera::new("S1"), plan)
            .expect("plan should be valid");
        let mut left = MemorySink::new();
        let mut right = MemorySink::new();

        let summary = session.run(&mut left, &mut right).expect("session should succeed");
        assert!(summary.cycles > 0);
        assert_eq!(left.frames_written(), right.frames_written());
    }
}
