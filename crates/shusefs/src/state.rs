//! In-memory mirror of the device: system and MQTT configuration, per-switch
//! and per-input config + live status, script slots with chunked-retrieval
//! state, and the schedule list.
//!
//! Every status field carries its own modification time so the filesystem
//! can surface exactly which of, say, `apower` vs `voltage` changed. The
//! contract is compare-then-stamp: a field's mtime advances only when an
//! update actually changes its value.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const MAX_SWITCHES: usize = 16;
pub const MAX_INPUTS: usize = 16;
pub const MAX_SCRIPTS: usize = 10;
pub const MAX_SCHEDULES: usize = 20;
pub const MAX_SCHEDULE_CALLS: usize = 5;
pub const MAX_SCRIPT_CODE: usize = 20_480;
pub const MAX_DEVICE_NAME: usize = 64;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<Mutex<DeviceState>>;

pub fn shared() -> SharedState {
    Arc::new(Mutex::new(DeviceState::new()))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("script code exceeds {MAX_SCRIPT_CODE} bytes")]
pub struct CodeTooLarge;

// ---------------------------------------------------------------------------
// System configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SysConfig {
    /// Compact serialization of the device's last `result` object.
    pub raw_json: Option<String>,
    pub device_name: String,
    pub location: String,
    pub eco_mode: bool,
    pub sntp_enabled: bool,
    pub valid: bool,
    pub last_update: i64,
}

// ---------------------------------------------------------------------------
// MQTT configuration
// ---------------------------------------------------------------------------

/// SSL CA verification scheme, keyed off the `ssl_ca` string the device
/// reports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SslCa {
    #[default]
    None,
    /// User-provided CA bundle ("user_ca.pem").
    User,
    /// Built-in CA bundle ("ca.pem").
    Builtin,
}

impl SslCa {
    pub fn parse(s: &str) -> Self {
        match s {
            "user_ca.pem" => SslCa::User,
            "ca.pem" => SslCa::Builtin,
            _ => SslCa::None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MqttConfig {
    pub raw_json: Option<String>,
    pub enable: bool,
    pub server: String,
    pub client_id: String,
    pub user: String,
    pub topic_prefix: String,
    pub ssl_ca: SslCa,
    pub enable_control: bool,
    pub rpc_ntf: bool,
    pub status_ntf: bool,
    pub use_client_cert: bool,
    pub enable_rpc: bool,
    pub valid: bool,
    pub last_update: i64,
}

// ---------------------------------------------------------------------------
// Switches
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SwitchInMode {
    Momentary,
    Follow,
    Flip,
    Detached,
    #[default]
    Unknown,
}

impl SwitchInMode {
    fn parse(s: &str) -> Self {
        match s {
            "momentary" => SwitchInMode::Momentary,
            "follow" => SwitchInMode::Follow,
            "flip" => SwitchInMode::Flip,
            "detached" => SwitchInMode::Detached,
            _ => SwitchInMode::Unknown,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SwitchInitialState {
    On,
    Off,
    RestoreLast,
    MatchInput,
    #[default]
    Unknown,
}

impl SwitchInitialState {
    fn parse(s: &str) -> Self {
        match s {
            "on" => SwitchInitialState::On,
            "off" => SwitchInitialState::Off,
            "restore_last" => SwitchInitialState::RestoreLast,
            "match_input" => SwitchInitialState::MatchInput,
            _ => SwitchInitialState::Unknown,
        }
    }
}

#[derive(Debug, Default)]
pub struct SwitchConfig {
    pub name: String,
    pub in_mode: SwitchInMode,
    pub in_locked: bool,
    pub initial_state: SwitchInitialState,
    pub auto_on: bool,
    pub auto_on_delay: f64,
    pub auto_off: bool,
    pub auto_off_delay: f64,
    pub power_limit: i64,
    pub voltage_limit: i64,
    pub autorecover_voltage_errors: bool,
    pub current_limit: f64,
}

/// Live switch telemetry. One mtime per field, stamped only on change.
#[derive(Debug, Default)]
pub struct SwitchStatus {
    pub id: i64,
    pub source: String,
    pub output: bool,
    pub apower: f64,
    pub voltage: f64,
    pub current: f64,
    pub freq: f64,
    pub energy: f64,
    pub ret_energy: f64,
    pub temperature_c: f64,
    pub temperature_f: f64,
    pub overtemperature: bool,
    pub last_update: i64,

    pub mtime_id: i64,
    pub mtime_source: i64,
    pub mtime_output: i64,
    pub mtime_apower: i64,
    pub mtime_voltage: i64,
    pub mtime_current: i64,
    pub mtime_freq: i64,
    pub mtime_energy: i64,
    pub mtime_ret_energy: i64,
    pub mtime_temperature: i64,
}

#[derive(Debug, Default)]
pub struct SwitchSlot {
    pub valid: bool,
    pub raw_json: Option<String>,
    pub config: SwitchConfig,
    pub status: SwitchStatus,
    pub last_update: i64,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Switch,
    Button,
    Analog,
    #[default]
    Unknown,
}

impl InputType {
    fn parse(s: &str) -> Self {
        match s {
            "switch" => InputType::Switch,
            "button" => InputType::Button,
            "analog" => InputType::Analog,
            _ => InputType::Unknown,
        }
    }
}

#[derive(Debug, Default)]
pub struct InputConfig {
    pub name: String,
    pub input_type: InputType,
    pub enable: bool,
    pub invert: bool,
    pub factory_reset: bool,
}

#[derive(Debug, Default)]
pub struct InputStatus {
    pub id: i64,
    pub state: bool,
    pub last_update: i64,
    pub mtime_id: i64,
    pub mtime_state: i64,
}

#[derive(Debug, Default)]
pub struct InputSlot {
    pub valid: bool,
    pub raw_json: Option<String>,
    pub config: InputConfig,
    pub status: InputStatus,
    pub last_update: i64,
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ScriptSlot {
    pub valid: bool,
    pub name: String,
    pub enable: bool,
    pub code: Option<String>,
    pub create_time: i64,
    pub modify_time: i64,

    // Runtime status (NotifyStatus).
    pub running: bool,
    pub mem_used: i64,
    pub mem_peak: i64,
    /// Raw JSON array of error strings, as reported.
    pub errors: Option<String>,
    pub last_status_update: i64,

    /// Request id of the final chunk of an in-flight upload. The matching
    /// response ack is how upload completion is recognised.
    pub last_upload_req_id: Option<u64>,
}

/// One retrieval cursor spans all scripts: code is fetched one script at a
/// time, chunk by chunk.
#[derive(Debug, Default)]
pub struct RetrievalCursor {
    pub script_id: Option<usize>,
    pub offset: usize,
    pub buffer: String,
}

#[derive(Debug, Deserialize)]
struct ScriptInfo {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    enable: bool,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScheduleCall {
    pub method: String,
    /// Raw params JSON, compact.
    pub params: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ScheduleSlot {
    pub id: i64,
    pub enable: bool,
    /// Six whitespace-separated fields: sec min hour dom month dow.
    pub timespec: String,
    pub calls: Vec<ScheduleCall>,
}

#[derive(Debug, Default)]
pub struct SchedulesState {
    /// Valid schedules in device (insertion) order.
    pub slots: Vec<ScheduleSlot>,
    /// Monotone revision the device emits with its list.
    pub rev: i64,
    pub last_update: i64,
}

#[derive(Debug, Deserialize)]
struct ScheduleJob {
    #[serde(default = "job_id_default")]
    id: i64,
    #[serde(default)]
    enable: bool,
    #[serde(default)]
    timespec: String,
    #[serde(default)]
    calls: Vec<ScheduleJobCall>,
}

fn job_id_default() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
struct ScheduleJobCall {
    method: String,
    params: Option<Value>,
}

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DeviceState {
    pub sys: SysConfig,
    pub mqtt: MqttConfig,
    pub switches: Vec<SwitchSlot>,
    pub inputs: Vec<InputSlot>,
    pub scripts: Vec<ScriptSlot>,
    pub cursor: RetrievalCursor,
    pub schedules: SchedulesState,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare-then-stamp: assign and mark the field's mtime only on change.
fn stamp<T: PartialEq>(field: &mut T, mtime: &mut i64, new: T, now: i64) {
    if *field != new {
        *field = new;
        *mtime = now;
    }
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            sys: SysConfig::default(),
            mqtt: MqttConfig::default(),
            switches: (0..MAX_SWITCHES).map(|_| SwitchSlot::default()).collect(),
            inputs: (0..MAX_INPUTS).map(|_| InputSlot::default()).collect(),
            scripts: (0..MAX_SCRIPTS).map(|_| ScriptSlot::default()).collect(),
            cursor: RetrievalCursor::default(),
            schedules: SchedulesState::default(),
        }
    }

    // -- System configuration ------------------------------------------

    /// Replace the cached system configuration with a `Sys.GetConfig`
    /// result object.
    pub fn update_sys_config(&mut self, result: &Value, now: i64) {
        self.sys.raw_json = Some(result.to_string());

        if let Some(name) = result
            .pointer("/device/name")
            .and_then(Value::as_str)
        {
            self.sys.device_name = name.chars().take(MAX_DEVICE_NAME).collect();
        }
        if let Some(tz) = result.pointer("/location/tz").and_then(Value::as_str) {
            self.sys.location = tz.to_string();
        }
        if let Some(eco) = result.pointer("/device/eco_mode") {
            self.sys.eco_mode = eco.as_bool().unwrap_or(eco.as_i64().unwrap_or(0) != 0);
        }
        if let Some(sntp) = result.pointer("/sys/sntp/enable") {
            self.sys.sntp_enabled = sntp.as_bool().unwrap_or(sntp.as_i64().unwrap_or(0) != 0);
        }

        self.sys.valid = true;
        self.sys.last_update = now;
        info!("system configuration updated");
    }

    // -- MQTT configuration --------------------------------------------

    /// Replace the cached MQTT configuration with an `MQTT.GetConfig`
    /// result object.
    pub fn update_mqtt_config(&mut self, result: &Value, now: i64) {
        self.mqtt.raw_json = Some(result.to_string());

        let m = &mut self.mqtt;
        if let Some(v) = result.get("enable").and_then(Value::as_bool) {
            m.enable = v;
        }
        if let Some(v) = result.get("server").and_then(Value::as_str) {
            m.server = v.to_string();
        }
        if let Some(v) = result.get("client_id").and_then(Value::as_str) {
            m.client_id = v.to_string();
        }
        if let Some(v) = result.get("user").and_then(Value::as_str) {
            m.user = v.to_string();
        }
        if let Some(v) = result.get("topic_prefix").and_then(Value::as_str) {
            m.topic_prefix = v.to_string();
        }
        if let Some(v) = result.get("ssl_ca").and_then(Value::as_str) {
            m.ssl_ca = SslCa::parse(v);
        }
        if let Some(v) = result.get("enable_control").and_then(Value::as_bool) {
            m.enable_control = v;
        }
        if let Some(v) = result.get("rpc_ntf").and_then(Value::as_bool) {
            m.rpc_ntf = v;
        }
        if let Some(v) = result.get("status_ntf").and_then(Value::as_bool) {
            m.status_ntf = v;
        }
        if let Some(v) = result.get("use_client_cert").and_then(Value::as_bool) {
            m.use_client_cert = v;
        }
        if let Some(v) = result.get("enable_rpc").and_then(Value::as_bool) {
            m.enable_rpc = v;
        }

        m.valid = true;
        m.last_update = now;
        info!("mqtt configuration updated");
    }

    // -- Switch configuration ------------------------------------------

    pub fn update_switch_config(&mut self, id: usize, result: &Value, now: i64) {
        let Some(slot) = self.switches.get_mut(id) else {
            return;
        };

        slot.raw_json = Some(result.to_string());

        let c = &mut slot.config;
        if let Some(v) = result.get("name").and_then(Value::as_str) {
            c.name = v.to_string();
        } else {
            c.name.clear();
        }
        if let Some(v) = result.get("in_mode").and_then(Value::as_str) {
            c.in_mode = SwitchInMode::parse(v);
        }
        if let Some(v) = result.get("in_locked").and_then(Value::as_bool) {
            c.in_locked = v;
        }
        if let Some(v) = result.get("initial_state").and_then(Value::as_str) {
            c.initial_state = SwitchInitialState::parse(v);
        }
        if let Some(v) = result.get("auto_on").and_then(Value::as_bool) {
            c.auto_on = v;
        }
        if let Some(v) = result.get("auto_on_delay").and_then(Value::as_f64) {
            c.auto_on_delay = v;
        }
        if let Some(v) = result.get("auto_off").and_then(Value::as_bool) {
            c.auto_off = v;
        }
        if let Some(v) = result.get("auto_off_delay").and_then(Value::as_f64) {
            c.auto_off_delay = v;
        }
        if let Some(v) = result.get("power_limit").and_then(Value::as_i64) {
            c.power_limit = v;
        }
        if let Some(v) = result.get("voltage_limit").and_then(Value::as_i64) {
            c.voltage_limit = v;
        }
        if let Some(v) = result
            .get("autorecover_voltage_errors")
            .and_then(Value::as_bool)
        {
            c.autorecover_voltage_errors = v;
        }
        if let Some(v) = result.get("current_limit").and_then(Value::as_f64) {
            c.current_limit = v;
        }

        slot.valid = true;
        slot.last_update = now;
        info!(switch = id, "switch configuration updated");
    }

    /// Mark a switch slot valid without a config (instance first seen in a
    /// notification; its config GET is still in flight).
    pub fn discover_switch(&mut self, id: usize) -> bool {
        match self.switches.get_mut(id) {
            Some(slot) if !slot.valid => {
                slot.valid = true;
                info!(switch = id, "new switch instance discovered");
                true
            }
            _ => false,
        }
    }

    // -- Switch status (selective update) ------------------------------

    /// Apply a partial status object to switch `id`. Fields absent from the
    /// payload, or present with an unchanged value, do not advance their
    /// mtime. Returns false if the slot is unknown.
    pub fn apply_switch_status(&mut self, id: usize, status: &Value, now: i64) -> bool {
        let Some(slot) = self.switches.get_mut(id).filter(|s| s.valid) else {
            return false;
        };
        let st = &mut slot.status;

        if let Some(v) = status.get("id").and_then(Value::as_i64) {
            stamp(&mut st.id, &mut st.mtime_id, v, now);
        }
        if let Some(v) = status.get("source").and_then(Value::as_str) {
            if st.source != v {
                st.source = v.to_string();
                st.mtime_source = now;
            }
        }
        if let Some(v) = status.get("output").and_then(Value::as_bool) {
            stamp(&mut st.output, &mut st.mtime_output, v, now);
        }
        if let Some(v) = status.get("apower").and_then(Value::as_f64) {
            stamp(&mut st.apower, &mut st.mtime_apower, v, now);
        }
        if let Some(v) = status.get("voltage").and_then(Value::as_f64) {
            stamp(&mut st.voltage, &mut st.mtime_voltage, v, now);
        }
        if let Some(v) = status.get("current").and_then(Value::as_f64) {
            stamp(&mut st.current, &mut st.mtime_current, v, now);
        }
        if let Some(v) = status.get("freq").and_then(Value::as_f64) {
            stamp(&mut st.freq, &mut st.mtime_freq, v, now);
        }
        if let Some(v) = status.pointer("/aenergy/total").and_then(Value::as_f64) {
            stamp(&mut st.energy, &mut st.mtime_energy, v, now);
        }
        if let Some(v) = status
            .pointer("/ret_aenergy/total")
            .and_then(Value::as_f64)
        {
            stamp(&mut st.ret_energy, &mut st.mtime_ret_energy, v, now);
        }
        if let Some(v) = status.pointer("/temperature/tC").and_then(Value::as_f64) {
            stamp(&mut st.temperature_c, &mut st.mtime_temperature, v, now);
        }
        if let Some(v) = status.pointer("/temperature/tF").and_then(Value::as_f64) {
            st.temperature_f = v;
        }
        if let Some(v) = status.get("overtemperature").and_then(Value::as_bool) {
            st.overtemperature = v;
        }

        st.last_update = now;
        debug!(
            switch = id,
            output = st.output,
            apower = st.apower,
            "switch status updated"
        );
        true
    }

    // -- Input configuration -------------------------------------------

    pub fn update_input_config(&mut self, id: usize, result: &Value, now: i64) {
        let Some(slot) = self.inputs.get_mut(id) else {
            return;
        };

        slot.raw_json = Some(result.to_string());

        let c = &mut slot.config;
        if let Some(v) = result.get("name").and_then(Value::as_str) {
            c.name = v.to_string();
        } else {
            c.name.clear();
        }
        if let Some(v) = result.get("type").and_then(Value::as_str) {
            c.input_type = InputType::parse(v);
        }
        if let Some(v) = result.get("enable").and_then(Value::as_bool) {
            c.enable = v;
        }
        if let Some(v) = result.get("invert").and_then(Value::as_bool) {
            c.invert = v;
        }
        if let Some(v) = result.get("factory_reset").and_then(Value::as_bool) {
            c.factory_reset = v;
        }

        slot.valid = true;
        slot.last_update = now;
        info!(input = id, "input configuration updated");
    }

    pub fn discover_input(&mut self, id: usize) -> bool {
        match self.inputs.get_mut(id) {
            Some(slot) if !slot.valid => {
                slot.valid = true;
                info!(input = id, "new input instance discovered");
                true
            }
            _ => false,
        }
    }

    /// Selective status update for input `id`; same compare-then-stamp
    /// contract as switches.
    pub fn apply_input_status(&mut self, id: usize, status: &Value, now: i64) -> bool {
        let Some(slot) = self.inputs.get_mut(id).filter(|s| s.valid) else {
            return false;
        };
        let st = &mut slot.status;

        if let Some(v) = status.get("id").and_then(Value::as_i64) {
            stamp(&mut st.id, &mut st.mtime_id, v, now);
        }
        if let Some(v) = status.get("state").and_then(Value::as_bool) {
            stamp(&mut st.state, &mut st.mtime_state, v, now);
        }

        st.last_update = now;
        true
    }

    // -- Scripts --------------------------------------------------------

    /// Replace the script table from a `Script.List` result. Previously
    /// cached code is dropped; the caller re-fetches sequentially.
    pub fn load_script_list(&mut self, result: &Value, now: i64) -> usize {
        for slot in &mut self.scripts {
            *slot = ScriptSlot::default();
        }
        self.cursor = RetrievalCursor::default();

        let Some(entries) = result.get("scripts").and_then(Value::as_array) else {
            warn!("script list response has no scripts array");
            return 0;
        };

        let mut count = 0;
        for entry in entries {
            let Ok(info) = serde_json::from_value::<ScriptInfo>(entry.clone()) else {
                warn!("skipping malformed script list entry");
                continue;
            };
            let Ok(id) = usize::try_from(info.id) else {
                continue;
            };
            let Some(slot) = self.scripts.get_mut(id) else {
                warn!(script = info.id, "script id out of range");
                continue;
            };
            slot.valid = true;
            slot.name = info.name;
            slot.enable = info.enable;
            slot.create_time = now;
            count += 1;
        }

        info!(count, "script list updated");
        count
    }

    /// Position the retrieval cursor on `id`, resetting it if a different
    /// script was in progress. Returns the offset for the next chunk.
    pub fn begin_script_retrieval(&mut self, id: usize) -> usize {
        if self.cursor.script_id != Some(id) {
            self.cursor = RetrievalCursor {
                script_id: Some(id),
                offset: 0,
                buffer: String::with_capacity(MAX_SCRIPT_CODE.min(4096)),
            };
        }
        self.cursor.offset
    }

    /// Append a received chunk for `id` and advance the offset.
    pub fn append_script_chunk(&mut self, id: usize, data: &str) -> Result<(), CodeTooLarge> {
        if self.cursor.script_id != Some(id) {
            warn!(script = id, "chunk for a script not being retrieved");
            return Ok(());
        }
        if self.cursor.buffer.len() + data.len() > MAX_SCRIPT_CODE {
            self.cursor = RetrievalCursor::default();
            return Err(CodeTooLarge);
        }
        self.cursor.buffer.push_str(data);
        self.cursor.offset += data.len();
        Ok(())
    }

    /// Complete a retrieval: move the accumulated buffer into the script
    /// slot and clear the cursor.
    pub fn finalize_script(&mut self, id: usize, now: i64) -> bool {
        if self.cursor.script_id != Some(id) {
            warn!(script = id, "no retrieval in progress to finalize");
            return false;
        }
        let buffer = std::mem::take(&mut self.cursor.buffer);
        self.cursor = RetrievalCursor::default();

        let Some(slot) = self.scripts.get_mut(id) else {
            return false;
        };
        info!(script = id, bytes = buffer.len(), "script code retrieved");
        slot.code = Some(buffer);
        slot.valid = true;
        slot.modify_time = now;
        true
    }

    /// First valid script at or after `start` whose code has not been
    /// fetched yet.
    pub fn next_script_without_code(&self, start: usize) -> Option<usize> {
        (start..MAX_SCRIPTS).find(|&i| {
            self.scripts
                .get(i)
                .map(|s| s.valid && s.code.is_none())
                .unwrap_or(false)
        })
    }

    /// Runtime status from a `script:N` notification object.
    pub fn apply_script_status(&mut self, id: usize, status: &Value, now: i64) -> bool {
        let Some(slot) = self.scripts.get_mut(id).filter(|s| s.valid) else {
            return false;
        };

        if let Some(v) = status.get("running").and_then(Value::as_bool) {
            slot.running = v;
        }
        if let Some(v) = status.get("mem_used").and_then(Value::as_i64) {
            slot.mem_used = v;
        }
        if let Some(v) = status.get("mem_peak").and_then(Value::as_i64) {
            slot.mem_peak = v;
        }
        if let Some(errors) = status.get("errors") {
            let rendered = errors.to_string();
            if rendered != "[]" {
                warn!(script = id, errors = %rendered, "script reported errors");
            }
            slot.errors = Some(rendered);
        }

        slot.last_status_update = now;
        true
    }

    // -- Schedules -------------------------------------------------------

    /// Replace the schedule list from a `Schedule.List` result and record
    /// the device revision.
    pub fn replace_schedules(&mut self, result: &Value, now: i64) -> usize {
        self.schedules.slots.clear();

        if let Some(rev) = result.get("rev").and_then(Value::as_i64) {
            self.schedules.rev = rev;
        }

        if let Some(jobs) = result.get("jobs").and_then(Value::as_array) {
            for job in jobs.iter().take(MAX_SCHEDULES) {
                let Ok(job) = serde_json::from_value::<ScheduleJob>(job.clone()) else {
                    warn!("skipping malformed schedule job");
                    continue;
                };
                let calls = job
                    .calls
                    .into_iter()
                    .take(MAX_SCHEDULE_CALLS)
                    .map(|c| ScheduleCall {
                        method: c.method,
                        params: c.params.map(|p| p.to_string()),
                    })
                    .collect();
                self.schedules.slots.push(ScheduleSlot {
                    id: job.id,
                    enable: job.enable,
                    timespec: job.timespec,
                    calls,
                });
            }
        }

        self.schedules.last_update = now;
        info!(
            count = self.schedules.slots.len(),
            rev = self.schedules.rev,
            "schedule list updated"
        );
        self.schedules.slots.len()
    }

    pub fn schedule_by_id(&self, id: i64) -> Option<&ScheduleSlot> {
        self.schedules.slots.iter().find(|s| s.id == id)
    }

    // -- Read accessors (filesystem surface) ----------------------------

    pub fn sys_config_json(&self) -> Option<String> {
        self.sys.valid.then(|| self.sys.raw_json.clone()).flatten()
    }

    pub fn mqtt_config_json(&self) -> Option<String> {
        self.mqtt
            .valid
            .then(|| self.mqtt.raw_json.clone())
            .flatten()
    }

    pub fn switch_config_json(&self, id: usize) -> Option<String> {
        self.switches
            .get(id)
            .filter(|s| s.valid)
            .and_then(|s| s.raw_json.clone())
    }

    pub fn input_config_json(&self, id: usize) -> Option<String> {
        self.inputs
            .get(id)
            .filter(|s| s.valid)
            .and_then(|s| s.raw_json.clone())
    }

    pub fn script_code(&self, id: usize) -> Option<String> {
        self.scripts
            .get(id)
            .filter(|s| s.valid)
            .and_then(|s| s.code.clone())
    }

    pub fn switch_is_valid(&self, id: usize) -> bool {
        self.switches.get(id).map(|s| s.valid).unwrap_or(false)
    }

    pub fn input_is_valid(&self, id: usize) -> bool {
        self.inputs.get(id).map(|s| s.valid).unwrap_or(false)
    }

    pub fn script_is_valid(&self, id: usize) -> bool {
        self.scripts.get(id).map(|s| s.valid).unwrap_or(false)
    }

    pub fn valid_switch_ids(&self) -> Vec<usize> {
        (0..MAX_SWITCHES).filter(|&i| self.switch_is_valid(i)).collect()
    }

    pub fn valid_input_ids(&self) -> Vec<usize> {
        (0..MAX_INPUTS).filter(|&i| self.input_is_valid(i)).collect()
    }

    pub fn valid_script_ids(&self) -> Vec<usize> {
        (0..MAX_SCRIPTS).filter(|&i| self.script_is_valid(i)).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with_switch(id: usize) -> DeviceState {
        let mut st = DeviceState::new();
        st.update_switch_config(id, &json!({"name": "sw", "in_mode": "follow"}), 100);
        st
    }

    // -- sys config ---------------------------------------------------------

    #[test]
    fn sys_config_parses_fields_and_stores_raw() {
        let mut st = DeviceState::new();
        let result = json!({
            "device": {"name": "plug-s", "eco_mode": true},
            "location": {"tz": "Europe/Sofia"},
            "sys": {"sntp": {"enable": true}}
        });
        st.update_sys_config(&result, 42);

        assert!(st.sys.valid);
        assert_eq!(st.sys.device_name, "plug-s");
        assert_eq!(st.sys.location, "Europe/Sofia");
        assert!(st.sys.eco_mode);
        assert!(st.sys.sntp_enabled);
        assert_eq!(st.sys.last_update, 42);
        // Raw JSON round-trips through serde_json untouched in content.
        let raw: Value = serde_json::from_str(st.sys.raw_json.as_deref().unwrap()).unwrap();
        assert_eq!(raw, result);
    }

    #[test]
    fn sys_config_truncates_overlong_device_name() {
        let mut st = DeviceState::new();
        let long = "x".repeat(100);
        st.update_sys_config(&json!({"device": {"name": long}}), 0);
        assert_eq!(st.sys.device_name.len(), MAX_DEVICE_NAME);
    }

    #[test]
    fn sys_config_refresh_replaces_raw_json() {
        let mut st = DeviceState::new();
        st.update_sys_config(&json!({"device": {"name": "a"}}), 1);
        st.update_sys_config(&json!({"device": {"name": "b"}}), 2);
        assert_eq!(st.sys.device_name, "b");
        assert!(st.sys.raw_json.as_deref().unwrap().contains("\"b\""));
        assert_eq!(st.sys.last_update, 2);
    }

    // -- mqtt config --------------------------------------------------------

    #[test]
    fn mqtt_config_parses_all_fields() {
        let mut st = DeviceState::new();
        st.update_mqtt_config(
            &json!({
                "enable": true,
                "server": "mqtt.example.com:1883",
                "client_id": "shellyplus1-a8032ab12345",
                "user": "iot",
                "topic_prefix": "shellyplus1",
                "ssl_ca": "user_ca.pem",
                "enable_control": true,
                "rpc_ntf": false,
                "status_ntf": true,
                "use_client_cert": false,
                "enable_rpc": true
            }),
            7,
        );

        let m = &st.mqtt;
        assert!(m.valid);
        assert!(m.enable);
        assert_eq!(m.server, "mqtt.example.com:1883");
        assert_eq!(m.ssl_ca, SslCa::User);
        assert!(m.enable_control);
        assert!(!m.rpc_ntf);
        assert!(m.status_ntf);
        assert!(m.enable_rpc);
    }

    #[test]
    fn ssl_ca_parse_variants() {
        assert_eq!(SslCa::parse("user_ca.pem"), SslCa::User);
        assert_eq!(SslCa::parse("ca.pem"), SslCa::Builtin);
        assert_eq!(SslCa::parse("*"), SslCa::None);
        assert_eq!(SslCa::parse(""), SslCa::None);
    }

    // -- switch config ------------------------------------------------------

    #[test]
    fn switch_config_parses_enums() {
        let mut st = DeviceState::new();
        st.update_switch_config(
            2,
            &json!({
                "name": "heater",
                "in_mode": "flip",
                "initial_state": "restore_last",
                "auto_off": true,
                "auto_off_delay": 60.5,
                "power_limit": 2500,
                "current_limit": 10.0
            }),
            5,
        );

        let sw = &st.switches[2];
        assert!(sw.valid);
        assert_eq!(sw.config.name, "heater");
        assert_eq!(sw.config.in_mode, SwitchInMode::Flip);
        assert_eq!(sw.config.initial_state, SwitchInitialState::RestoreLast);
        assert!(sw.config.auto_off);
        assert_eq!(sw.config.auto_off_delay, 60.5);
        assert_eq!(sw.config.power_limit, 2500);
        assert_eq!(sw.config.current_limit, 10.0);
    }

    #[test]
    fn switch_config_out_of_range_id_ignored() {
        let mut st = DeviceState::new();
        st.update_switch_config(MAX_SWITCHES, &json!({"name": "x"}), 0);
        assert!(st.valid_switch_ids().is_empty());
    }

    // -- selective switch status update --------------------------------------

    #[test]
    fn status_update_stamps_only_changed_fields() {
        let mut st = state_with_switch(0);
        st.apply_switch_status(0, &json!({"apower": 5.1, "voltage": 230.4}), 500);

        // Only apower arrives, with a new value.
        st.apply_switch_status(0, &json!({"apower": 7.3}), 1000);

        let s = &st.switches[0].status;
        assert_eq!(s.apower, 7.3);
        assert_eq!(s.mtime_apower, 1000);
        assert_eq!(s.voltage, 230.4);
        assert_eq!(s.mtime_voltage, 500); // untouched
    }

    #[test]
    fn status_update_with_unchanged_value_keeps_mtime() {
        let mut st = state_with_switch(0);
        st.apply_switch_status(0, &json!({"output": true}), 500);
        st.apply_switch_status(0, &json!({"output": true}), 1000);

        assert_eq!(st.switches[0].status.mtime_output, 500);
        assert_eq!(st.switches[0].status.last_update, 1000);
    }

    #[test]
    fn status_update_parses_nested_energy_and_temperature() {
        let mut st = state_with_switch(1);
        st.apply_switch_status(
            1,
            &json!({
                "id": 1,
                "source": "WS_in",
                "output": true,
                "aenergy": {"total": 1234.567},
                "ret_aenergy": {"total": 0.25},
                "temperature": {"tC": 41.3, "tF": 106.3}
            }),
            900,
        );

        let s = &st.switches[1].status;
        assert_eq!(s.energy, 1234.567);
        assert_eq!(s.mtime_energy, 900);
        assert_eq!(s.ret_energy, 0.25);
        assert_eq!(s.temperature_c, 41.3);
        assert_eq!(s.temperature_f, 106.3);
        assert_eq!(s.source, "WS_in");
    }

    #[test]
    fn status_update_for_invalid_slot_is_rejected() {
        let mut st = DeviceState::new();
        assert!(!st.apply_switch_status(3, &json!({"output": true}), 1));
    }

    #[test]
    fn discover_switch_marks_slot_valid_once() {
        let mut st = DeviceState::new();
        assert!(st.discover_switch(5));
        assert!(st.switch_is_valid(5));
        assert!(!st.discover_switch(5)); // already known
        assert!(!st.discover_switch(MAX_SWITCHES)); // out of range
    }

    // -- input status ---------------------------------------------------------

    #[test]
    fn input_status_selective_update() {
        let mut st = DeviceState::new();
        st.update_input_config(0, &json!({"name": "door", "type": "switch"}), 10);
        st.apply_input_status(0, &json!({"id": 0, "state": true}), 20);
        st.apply_input_status(0, &json!({"state": true}), 30);

        let s = &st.inputs[0].status;
        assert!(s.state);
        assert_eq!(s.mtime_state, 20); // unchanged at t=30
        assert_eq!(st.inputs[0].config.input_type, InputType::Switch);
    }

    // -- scripts --------------------------------------------------------------

    #[test]
    fn script_list_resets_and_populates_slots() {
        let mut st = DeviceState::new();
        st.scripts[4].valid = true;
        st.scripts[4].code = Some("stale".into());

        let n = st.load_script_list(
            &json!({"scripts": [
                {"id": 1, "name": "blink.js", "enable": true},
                {"id": 3, "name": "report.js", "enable": false}
            ]}),
            50,
        );

        assert_eq!(n, 2);
        assert_eq!(st.valid_script_ids(), vec![1, 3]);
        assert_eq!(st.scripts[1].name, "blink.js");
        assert!(st.scripts[1].enable);
        assert!(!st.scripts[3].enable);
        // Stale slot 4 was cleared by the reset.
        assert!(!st.scripts[4].valid);
        assert!(st.scripts[4].code.is_none());
    }

    #[test]
    fn script_list_ignores_out_of_range_ids() {
        let mut st = DeviceState::new();
        let n = st.load_script_list(&json!({"scripts": [{"id": 99, "name": "x"}]}), 0);
        assert_eq!(n, 0);
    }

    #[test]
    fn script_chunks_accumulate_and_finalize() {
        let mut st = DeviceState::new();
        st.load_script_list(&json!({"scripts": [{"id": 2, "name": "s.js"}]}), 0);

        assert_eq!(st.begin_script_retrieval(2), 0);
        st.append_script_chunk(2, "let x = 1;\n").unwrap();
        assert_eq!(st.cursor.offset, 11);
        st.append_script_chunk(2, "let y = 2;\n").unwrap();
        assert_eq!(st.cursor.offset, 22);

        assert!(st.finalize_script(2, 99));
        assert_eq!(st.script_code(2).as_deref(), Some("let x = 1;\nlet y = 2;\n"));
        assert_eq!(st.scripts[2].modify_time, 99);
        assert_eq!(st.cursor.script_id, None);
    }

    #[test]
    fn begin_retrieval_resumes_same_script_at_offset() {
        let mut st = DeviceState::new();
        st.load_script_list(&json!({"scripts": [{"id": 0, "name": "a.js"}]}), 0);
        st.begin_script_retrieval(0);
        st.append_script_chunk(0, "abcd").unwrap();
        // Same script: cursor keeps its offset for the follow-up request.
        assert_eq!(st.begin_script_retrieval(0), 4);
        // Different script: cursor resets.
        assert_eq!(st.begin_script_retrieval(1), 0);
    }

    #[test]
    fn oversized_script_chunk_is_rejected() {
        let mut st = DeviceState::new();
        st.load_script_list(&json!({"scripts": [{"id": 0, "name": "a.js"}]}), 0);
        st.begin_script_retrieval(0);
        let big = "x".repeat(MAX_SCRIPT_CODE + 1);
        assert_eq!(st.append_script_chunk(0, &big), Err(CodeTooLarge));
        // Cursor cleared; retrieval can restart cleanly.
        assert_eq!(st.cursor.script_id, None);
    }

    #[test]
    fn next_script_without_code_walks_in_order() {
        let mut st = DeviceState::new();
        st.load_script_list(
            &json!({"scripts": [{"id": 1}, {"id": 3}, {"id": 7}]}),
            0,
        );
        assert_eq!(st.next_script_without_code(0), Some(1));
        st.begin_script_retrieval(1);
        st.finalize_script(1, 0);
        assert_eq!(st.next_script_without_code(2), Some(3));
        assert_eq!(st.next_script_without_code(4), Some(7));
        assert_eq!(st.next_script_without_code(8), None);
    }

    #[test]
    fn script_status_updates_runtime_fields() {
        let mut st = DeviceState::new();
        st.load_script_list(&json!({"scripts": [{"id": 0, "name": "a.js"}]}), 0);
        st.apply_script_status(
            0,
            &json!({"running": true, "mem_used": 1024, "mem_peak": 2048, "errors": []}),
            60,
        );

        let s = &st.scripts[0];
        assert!(s.running);
        assert_eq!(s.mem_used, 1024);
        assert_eq!(s.mem_peak, 2048);
        assert_eq!(s.errors.as_deref(), Some("[]"));
        assert_eq!(s.last_status_update, 60);
    }

    // -- schedules -------------------------------------------------------------

    #[test]
    fn schedule_list_replaces_slots_and_records_rev() {
        let mut st = DeviceState::new();
        let n = st.replace_schedules(
            &json!({"rev": 7, "jobs": [
                {"id": 1, "enable": true, "timespec": "0 0 6 * * *",
                 "calls": [{"method": "Switch.Set", "params": {"id": 0, "on": true}}]},
                {"id": 2, "enable": false, "timespec": "0 30 22 * * 1",
                 "calls": [{"method": "Switch.Set", "params": {"id": 0, "on": false}}]}
            ]}),
            80,
        );

        assert_eq!(n, 2);
        assert_eq!(st.schedules.rev, 7);
        let first = st.schedule_by_id(1).unwrap();
        assert!(first.enable);
        assert_eq!(first.timespec, "0 0 6 * * *");
        assert_eq!(first.calls[0].method, "Switch.Set");
        assert_eq!(
            first.calls[0].params.as_deref(),
            Some(r#"{"id":0,"on":true}"#)
        );
    }

    #[test]
    fn schedule_list_refresh_drops_stale_entries() {
        let mut st = DeviceState::new();
        st.replace_schedules(
            &json!({"rev": 1, "jobs": [{"id": 9, "enable": true, "timespec": "* * * * * *"}]}),
            0,
        );
        st.replace_schedules(&json!({"rev": 2, "jobs": []}), 1);

        assert!(st.schedules.slots.is_empty());
        assert_eq!(st.schedules.rev, 2);
        assert!(st.schedule_by_id(9).is_none());
    }

    #[test]
    fn schedule_calls_capped() {
        let mut st = DeviceState::new();
        let calls: Vec<Value> = (0..8)
            .map(|i| json!({"method": format!("M{i}")}))
            .collect();
        st.replace_schedules(
            &json!({"rev": 1, "jobs": [{"id": 1, "enable": true, "timespec": "* * * * * *", "calls": calls}]}),
            0,
        );
        assert_eq!(st.schedule_by_id(1).unwrap().calls.len(), MAX_SCHEDULE_CALLS);
    }
}
