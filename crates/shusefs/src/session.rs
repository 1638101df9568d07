//! The device session: verb-level operations that construct and queue
//! JSON-RPC requests, and the dispatcher that routes correlated responses
//! and device notifications into the state cache.
//!
//! Verbs never send — they queue. The WebSocket driver drains the queue and
//! owns all network I/O. Mutations are never applied speculatively: the
//! cache changes only when the device has answered.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::crontab::{self, SyncOp};
use crate::queue::{QueueFull, RequestQueue};
use crate::rpc::{self, Frame, RpcMethod};
use crate::state::{
    now_unix, CodeTooLarge, SharedState, MAX_INPUTS, MAX_SCRIPTS, MAX_SCRIPT_CODE, MAX_SWITCHES,
};

/// Instance ids probed on connect. Devices with more switches/inputs are
/// discovered later through notifications.
pub const DISCOVERY_WINDOW: usize = 4;

/// Script code is uploaded in chunks of at most this many bytes.
pub const SCRIPT_CHUNK_SIZE: usize = 2048;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("unknown {kind} instance {id}")]
    NoSuchInstance { kind: &'static str, id: usize },
    #[error(transparent)]
    CodeTooLarge(#[from] CodeTooLarge),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Shared handle threaded into both the network driver and the filesystem
/// adaptor.
#[derive(Clone)]
pub struct Session {
    state: SharedState,
    queue: Arc<RequestQueue>,
    /// Serialises id allocation against request construction so concurrent
    /// filesystem handlers cannot interleave between peek and enqueue.
    intent: Arc<Mutex<()>>,
}

impl Session {
    pub fn new(state: SharedState, queue: Arc<RequestQueue>) -> Self {
        Self {
            state,
            queue,
            intent: Arc::new(Mutex::new(())),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Peek the next correlation id, build the envelope, queue it. The id
    /// embedded in the request always matches the id the table assigns.
    fn enqueue(&self, method: RpcMethod, params: Option<Value>) -> Result<u64, SessionError> {
        let _guard = self.intent.lock().unwrap();
        let id = self.queue.next_id();
        let request = rpc::build_request(method, id, params.as_ref());
        let assigned = self.queue.enqueue(request, now_unix())?;
        debug_assert_eq!(assigned, id);
        debug!(req_id = assigned, method = method.as_str(), "request queued");
        Ok(assigned)
    }

    fn check_switch(&self, id: usize) -> Result<(), SessionError> {
        (id < MAX_SWITCHES)
            .then_some(())
            .ok_or(SessionError::NoSuchInstance { kind: "switch", id })
    }

    fn check_input(&self, id: usize) -> Result<(), SessionError> {
        (id < MAX_INPUTS)
            .then_some(())
            .ok_or(SessionError::NoSuchInstance { kind: "input", id })
    }

    fn check_script(&self, id: usize) -> Result<(), SessionError> {
        (id < MAX_SCRIPTS)
            .then_some(())
            .ok_or(SessionError::NoSuchInstance { kind: "script", id })
    }

    // -- Refresh verbs (GETs) -------------------------------------------

    pub fn request_sys_config(&self) -> Result<u64, SessionError> {
        self.enqueue(RpcMethod::SysGetConfig, None)
    }

    pub fn request_mqtt_config(&self) -> Result<u64, SessionError> {
        self.enqueue(RpcMethod::MqttGetConfig, None)
    }

    pub fn request_switch_config(&self, id: usize) -> Result<u64, SessionError> {
        self.check_switch(id)?;
        self.enqueue(RpcMethod::SwitchGetConfig, Some(json!({"id": id})))
    }

    pub fn request_switch_status(&self, id: usize) -> Result<u64, SessionError> {
        self.check_switch(id)?;
        self.enqueue(RpcMethod::SwitchGetStatus, Some(json!({"id": id})))
    }

    pub fn request_input_config(&self, id: usize) -> Result<u64, SessionError> {
        self.check_input(id)?;
        self.enqueue(RpcMethod::InputGetConfig, Some(json!({"id": id})))
    }

    pub fn request_input_status(&self, id: usize) -> Result<u64, SessionError> {
        self.check_input(id)?;
        self.enqueue(RpcMethod::InputGetStatus, Some(json!({"id": id})))
    }

    pub fn request_script_list(&self) -> Result<u64, SessionError> {
        self.enqueue(RpcMethod::ScriptList, None)
    }

    /// Fetch the next chunk of a script's code, starting or resuming the
    /// retrieval cursor for this id.
    pub fn request_script_code(&self, id: usize) -> Result<u64, SessionError> {
        self.check_script(id)?;
        let offset = self.state.lock().unwrap().begin_script_retrieval(id);
        self.enqueue(
            RpcMethod::ScriptGetCode,
            Some(json!({"id": id, "offset": offset})),
        )
    }

    pub fn request_schedule_list(&self) -> Result<u64, SessionError> {
        self.enqueue(RpcMethod::ScheduleList, None)
    }

    /// The refresh burst issued on every (re)connect. The cache keeps its
    /// previous content until the answers arrive.
    pub fn refresh_all(&self) -> Result<(), SessionError> {
        self.request_sys_config()?;
        self.request_mqtt_config()?;
        self.request_script_list()?;
        self.request_schedule_list()?;
        for id in 0..DISCOVERY_WINDOW {
            self.request_switch_config(id)?;
        }
        for id in 0..DISCOVERY_WINDOW {
            self.request_switch_status(id)?;
        }
        for id in 0..DISCOVERY_WINDOW {
            self.request_input_config(id)?;
        }
        for id in 0..DISCOVERY_WINDOW {
            self.request_input_status(id)?;
        }
        Ok(())
    }

    // -- Mutation verbs (SETs) ------------------------------------------

    pub fn set_switch(&self, id: usize, on: bool) -> Result<u64, SessionError> {
        self.check_switch(id)?;
        info!(switch = id, on, "queueing switch output change");
        self.enqueue(RpcMethod::SwitchSet, Some(json!({"id": id, "on": on})))
    }

    fn parse_user_json(&self, user_json: &str) -> Result<Value, SessionError> {
        serde_json::from_str(user_json).map_err(|e| SessionError::InvalidJson(e.to_string()))
    }

    pub fn set_sys_config_json(&self, user_json: &str) -> Result<u64, SessionError> {
        let config = self.parse_user_json(user_json)?;
        self.enqueue(RpcMethod::SysSetConfig, Some(json!({"config": config})))
    }

    pub fn set_mqtt_config_json(&self, user_json: &str) -> Result<u64, SessionError> {
        let config = self.parse_user_json(user_json)?;
        self.enqueue(RpcMethod::MqttSetConfig, Some(json!({"config": config})))
    }

    pub fn set_switch_config_json(&self, id: usize, user_json: &str) -> Result<u64, SessionError> {
        self.check_switch(id)?;
        let config = self.parse_user_json(user_json)?;
        self.enqueue(
            RpcMethod::SwitchSetConfig,
            Some(json!({"id": id, "config": config})),
        )
    }

    pub fn set_input_config_json(&self, id: usize, user_json: &str) -> Result<u64, SessionError> {
        self.check_input(id)?;
        let config = self.parse_user_json(user_json)?;
        self.enqueue(
            RpcMethod::InputSetConfig,
            Some(json!({"id": id, "config": config})),
        )
    }

    /// Upload script code in chunks of at most [`SCRIPT_CHUNK_SIZE`] bytes;
    /// the first chunk replaces, the rest append. The final chunk's request
    /// id is recorded so the matching ack can trigger a canonical re-fetch.
    pub fn put_script_code(&self, id: usize, code: &str) -> Result<u64, SessionError> {
        self.check_script(id)?;
        if code.len() > MAX_SCRIPT_CODE {
            return Err(CodeTooLarge.into());
        }
        if !self.state.lock().unwrap().script_is_valid(id) {
            return Err(SessionError::NoSuchInstance { kind: "script", id });
        }

        info!(
            script = id,
            bytes = code.len(),
            chunk = SCRIPT_CHUNK_SIZE,
            "uploading script code"
        );

        let mut last_id = 0;
        let mut offset = 0;
        let mut first = true;
        while offset < code.len() || first {
            let mut end = (offset + SCRIPT_CHUNK_SIZE).min(code.len());
            while !code.is_char_boundary(end) {
                end -= 1;
            }
            // Control bytes below 0x20 other than \n \r \t are dropped; the
            // JSON encoder escapes the rest.
            let chunk: String = code[offset..end]
                .chars()
                .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
                .collect();

            last_id = self.enqueue(
                RpcMethod::ScriptPutCode,
                Some(json!({"id": id, "code": chunk, "append": !first})),
            )?;

            offset = end;
            first = false;
        }

        let now = now_unix();
        let mut st = self.state.lock().unwrap();
        if let Some(slot) = st.scripts.get_mut(id) {
            slot.code = Some(code.to_string());
            slot.modify_time = now;
            slot.last_upload_req_id = Some(last_id);
        }

        Ok(last_id)
    }

    // -- Schedule verbs --------------------------------------------------

    fn schedule_call(
        &self,
        method: &str,
        params: Option<&str>,
    ) -> Result<Value, SessionError> {
        Ok(match params {
            Some(p) if !p.is_empty() => {
                let parsed = self.parse_user_json(p)?;
                json!({"method": method, "params": parsed})
            }
            _ => json!({"method": method}),
        })
    }

    pub fn create_schedule(
        &self,
        enable: bool,
        timespec: &str,
        method: &str,
        params: Option<&str>,
    ) -> Result<u64, SessionError> {
        let call = self.schedule_call(method, params)?;
        self.enqueue(
            RpcMethod::ScheduleCreate,
            Some(json!({"enable": enable, "timespec": timespec, "calls": [call]})),
        )
    }

    pub fn update_schedule(
        &self,
        id: i64,
        enable: bool,
        timespec: &str,
        method: &str,
        params: Option<&str>,
    ) -> Result<u64, SessionError> {
        let call = self.schedule_call(method, params)?;
        self.enqueue(
            RpcMethod::ScheduleUpdate,
            Some(json!({"id": id, "enable": enable, "timespec": timespec, "calls": [call]})),
        )
    }

    pub fn delete_schedule(&self, id: i64) -> Result<u64, SessionError> {
        self.enqueue(RpcMethod::ScheduleDelete, Some(json!({"id": id})))
    }

    /// Differential crontab sync: parse the edited document, diff it against
    /// the cache, and queue the resulting operations. Returns how many were
    /// queued.
    pub fn sync_crontab(&self, content: &str) -> Result<usize, SessionError> {
        let parsed = crontab::parse(content);
        let ops = {
            let st = self.state.lock().unwrap();
            crontab::plan(&parsed, &st.schedules)
        };

        let mut queued = 0;
        for op in ops {
            let outcome = match &op {
                SyncOp::Create {
                    enable,
                    timespec,
                    method,
                    params,
                } => self.create_schedule(*enable, timespec, method, params.as_deref()),
                SyncOp::Update {
                    id,
                    enable,
                    timespec,
                    method,
                    params,
                } => self.update_schedule(*id, *enable, timespec, method, params.as_deref()),
                SyncOp::Delete { id } => self.delete_schedule(*id),
            };
            match outcome {
                Ok(_) => queued += 1,
                Err(SessionError::InvalidJson(e)) => {
                    warn!(error = %e, "invalid params JSON in crontab line; skipping");
                }
                Err(e) => return Err(e),
            }
        }

        info!(ops = queued, "crontab sync queued");
        Ok(queued)
    }

    // -- Inbound dispatch -------------------------------------------------

    /// Entry point for every inbound WebSocket text frame.
    pub fn handle_frame(&self, text: &str) {
        let now = now_unix();
        match rpc::classify(text) {
            Err(e) => warn!(error = %e, "dropping unparseable frame"),
            Ok(Frame::Response { id, body }) => self.handle_response(id, &body, text, now),
            Ok(Frame::Notification { method, params }) => {
                self.handle_notification(&method, params.as_ref(), now)
            }
        }
    }

    fn handle_response(&self, id: u64, body: &Value, text: &str, now: i64) {
        let Some(request) = self.queue.request_of(id) else {
            warn!(req_id = id, "response for unknown request id");
            return;
        };

        match rpc::method_of_request(&request) {
            Some(method) => self.dispatch_response(method, &request, id, body, now),
            None => warn!(req_id = id, "response for request with unknown method"),
        }

        if let Err(e) = self.queue.complete(id, text.to_string()) {
            warn!(req_id = id, error = %e, "could not complete request");
        }
    }

    fn dispatch_response(
        &self,
        method: RpcMethod,
        request: &str,
        id: u64,
        body: &Value,
        now: i64,
    ) {
        let error = rpc::error_message(body);
        let result = body.get("result");

        match method {
            RpcMethod::SysGetConfig => match (error, result) {
                (Some(e), _) => warn!(error = %e, "Sys.GetConfig failed"),
                (None, Some(result)) => {
                    self.state.lock().unwrap().update_sys_config(result, now);
                }
                (None, None) => warn!("Sys.GetConfig response without result"),
            },

            RpcMethod::SysSetConfig => match error {
                Some(e) => {
                    warn!(error = %e, "Sys.SetConfig rejected; cached configuration preserved");
                }
                None => {
                    info!("system configuration set; refreshing canonical state");
                    self.log_refresh(self.request_sys_config());
                }
            },

            RpcMethod::MqttGetConfig => match (error, result) {
                (Some(e), _) => warn!(error = %e, "MQTT.GetConfig failed"),
                (None, Some(result)) => {
                    self.state.lock().unwrap().update_mqtt_config(result, now);
                }
                (None, None) => warn!("MQTT.GetConfig response without result"),
            },

            RpcMethod::MqttSetConfig => match error {
                Some(e) => {
                    warn!(error = %e, "MQTT.SetConfig rejected; cached configuration preserved");
                }
                None => {
                    info!("mqtt configuration set; refreshing canonical state");
                    self.log_refresh(self.request_mqtt_config());
                }
            },

            RpcMethod::SwitchGetConfig => {
                let Some(sw) = rpc::instance_id_of_request(request) else {
                    return;
                };
                match (error, result) {
                    // Error means the instance does not exist on this device.
                    (Some(_), _) => debug!(switch = sw, "no such switch on device"),
                    (None, Some(result)) => {
                        self.state
                            .lock()
                            .unwrap()
                            .update_switch_config(sw, result, now);
                    }
                    (None, None) => warn!(switch = sw, "Switch.GetConfig response without result"),
                }
            }

            RpcMethod::SwitchSetConfig => {
                let Some(sw) = rpc::instance_id_of_request(request) else {
                    return;
                };
                match error {
                    Some(e) => warn!(
                        switch = sw,
                        error = %e,
                        "Switch.SetConfig rejected; cached configuration preserved"
                    ),
                    None => {
                        info!(switch = sw, "switch configuration set; refreshing");
                        self.log_refresh(self.request_switch_config(sw));
                    }
                }
            }

            RpcMethod::SwitchSet => {
                let Some(sw) = rpc::instance_id_of_request(request) else {
                    return;
                };
                match error {
                    Some(e) => warn!(switch = sw, error = %e, "Switch.Set failed"),
                    None => {
                        // The response body is the post-change status; apply
                        // it, then confirm with an explicit status fetch.
                        if let Some(result) = result {
                            self.state
                                .lock()
                                .unwrap()
                                .apply_switch_status(sw, result, now);
                        }
                        self.log_refresh(self.request_switch_status(sw));
                    }
                }
            }

            RpcMethod::SwitchGetStatus => {
                let Some(sw) = rpc::instance_id_of_request(request) else {
                    return;
                };
                match (error, result) {
                    (Some(_), _) => debug!(switch = sw, "no such switch on device"),
                    (None, Some(result)) => {
                        self.state
                            .lock()
                            .unwrap()
                            .apply_switch_status(sw, result, now);
                    }
                    (None, None) => {}
                }
            }

            RpcMethod::InputGetConfig => {
                let Some(input) = rpc::instance_id_of_request(request) else {
                    return;
                };
                match (error, result) {
                    (Some(_), _) => debug!(input, "no such input on device"),
                    (None, Some(result)) => {
                        self.state
                            .lock()
                            .unwrap()
                            .update_input_config(input, result, now);
                    }
                    (None, None) => warn!(input, "Input.GetConfig response without result"),
                }
            }

            RpcMethod::InputSetConfig => {
                let Some(input) = rpc::instance_id_of_request(request) else {
                    return;
                };
                match error {
                    Some(e) => warn!(
                        input,
                        error = %e,
                        "Input.SetConfig rejected; cached configuration preserved"
                    ),
                    None => {
                        info!(input, "input configuration set; refreshing");
                        self.log_refresh(self.request_input_config(input));
                    }
                }
            }

            RpcMethod::InputGetStatus => {
                let Some(input) = rpc::instance_id_of_request(request) else {
                    return;
                };
                match (error, result) {
                    (Some(_), _) => debug!(input, "no such input on device"),
                    (None, Some(result)) => {
                        self.state
                            .lock()
                            .unwrap()
                            .apply_input_status(input, result, now);
                    }
                    (None, None) => {}
                }
            }

            RpcMethod::ScriptList => match (error, result) {
                (Some(e), _) => warn!(error = %e, "Script.List failed"),
                (None, Some(result)) => {
                    let first = {
                        let mut st = self.state.lock().unwrap();
                        let count = st.load_script_list(result, now);
                        (count > 0).then(|| st.next_script_without_code(0)).flatten()
                    };
                    // Code is fetched one script at a time; the next one is
                    // chained when this one finalizes.
                    if let Some(first) = first {
                        self.log_refresh(self.request_script_code(first));
                    }
                }
                (None, None) => warn!("Script.List response without result"),
            },

            RpcMethod::ScriptGetCode => {
                let Some(script) = rpc::instance_id_of_request(request) else {
                    return;
                };
                if let Some(e) = error {
                    warn!(script, error = %e, "Script.GetCode failed");
                    return;
                }
                let Some(result) = result else {
                    warn!(script, "Script.GetCode response without result");
                    return;
                };

                let data = result.get("data").and_then(Value::as_str).unwrap_or("");
                let left = result.get("left").and_then(Value::as_i64).unwrap_or(0);

                let next = {
                    let mut st = self.state.lock().unwrap();
                    if let Err(e) = st.append_script_chunk(script, data) {
                        warn!(script, error = %e, "dropping oversized script");
                        return;
                    }
                    debug!(script, bytes = data.len(), left, "script chunk received");
                    if left > 0 {
                        Some(script)
                    } else {
                        st.finalize_script(script, now);
                        st.next_script_without_code(script + 1)
                    }
                };

                if let Some(next) = next {
                    self.log_refresh(self.request_script_code(next));
                }
            }

            RpcMethod::ScriptPutCode => {
                let Some(script) = rpc::instance_id_of_request(request) else {
                    return;
                };
                if let Some(e) = error {
                    warn!(script, error = %e, "Script.PutCode chunk rejected");
                    return;
                }
                let upload_done = {
                    let mut st = self.state.lock().unwrap();
                    match st.scripts.get_mut(script) {
                        Some(slot) if slot.last_upload_req_id == Some(id) => {
                            slot.last_upload_req_id = None;
                            // Drop the local copy so the canonical re-fetch
                            // starts from a clean slot.
                            slot.code = None;
                            true
                        }
                        _ => false,
                    }
                };
                if upload_done {
                    info!(script, "script upload acked; refreshing canonical code");
                    self.log_refresh(self.request_script_code(script));
                }
            }

            RpcMethod::ScheduleList => match (error, result) {
                (Some(e), _) => warn!(error = %e, "Schedule.List failed"),
                (None, Some(result)) => {
                    self.state.lock().unwrap().replace_schedules(result, now);
                }
                (None, None) => warn!("Schedule.List response without result"),
            },

            RpcMethod::ScheduleCreate | RpcMethod::ScheduleUpdate | RpcMethod::ScheduleDelete => {
                if let Some(e) = error {
                    warn!(error = %e, "schedule operation failed");
                }
                // Refresh unconditionally: device-assigned ids and the
                // revision counter only come from Schedule.List.
                self.log_refresh(self.request_schedule_list());
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<&Value>, now: i64) {
        match method {
            "NotifyStatus" => {
                if let Some(params) = params {
                    self.apply_status_notification(params, now);
                }
            }
            "NotifyEvent" => {
                if let Some(params) = params {
                    self.apply_event_notification(params);
                }
            }
            other => debug!(method = other, "ignoring unhandled notification"),
        }
    }

    /// `NotifyStatus` params are keyed `switch:N` / `input:N` / `script:N`
    /// with partial status objects. An unknown switch or input id is
    /// discovery of a new instance, not an error.
    fn apply_status_notification(&self, params: &Value, now: i64) {
        let Some(map) = params.as_object() else {
            return;
        };

        let mut discovered_switches = Vec::new();
        let mut discovered_inputs = Vec::new();

        {
            let mut st = self.state.lock().unwrap();
            for (key, status) in map {
                if let Some(id) = key.strip_prefix("switch:").and_then(|s| s.parse().ok()) {
                    if st.discover_switch(id) {
                        discovered_switches.push(id);
                    }
                    st.apply_switch_status(id, status, now);
                } else if let Some(id) = key.strip_prefix("input:").and_then(|s| s.parse().ok()) {
                    if st.discover_input(id) {
                        discovered_inputs.push(id);
                    }
                    st.apply_input_status(id, status, now);
                } else if let Some(id) = key.strip_prefix("script:").and_then(|s| s.parse().ok()) {
                    st.apply_script_status(id, status, now);
                }
            }
        }

        for id in discovered_switches {
            self.log_refresh(self.request_switch_config(id));
        }
        for id in discovered_inputs {
            self.log_refresh(self.request_input_config(id));
        }
    }

    /// `NotifyEvent` carries an events array; `config_changed` events make
    /// the cached config for that component stale, so it is re-fetched. The
    /// event's instance id is not relied upon: all valid instances of the
    /// class refresh.
    fn apply_event_notification(&self, params: &Value) {
        let Some(events) = params.get("events").and_then(Value::as_array) else {
            return;
        };

        let mut refresh_sys = false;
        let mut refresh_mqtt = false;
        let mut refresh_switches = false;
        let mut refresh_inputs = false;

        for event in events {
            if event.get("event").and_then(Value::as_str) != Some("config_changed") {
                continue;
            }
            let component = event
                .get("component")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match component.split(':').next().unwrap_or_default() {
                "sys" => refresh_sys = true,
                "mqtt" => refresh_mqtt = true,
                "switch" => refresh_switches = true,
                "input" => refresh_inputs = true,
                other => debug!(component = other, "config change for unmirrored component"),
            }
        }

        if refresh_sys {
            info!("system configuration changed on device; refreshing");
            self.log_refresh(self.request_sys_config());
        }
        if refresh_mqtt {
            info!("mqtt configuration changed on device; refreshing");
            self.log_refresh(self.request_mqtt_config());
        }
        if refresh_switches {
            info!("switch configuration changed on device; refreshing all switches");
            let ids = self.state.lock().unwrap().valid_switch_ids();
            for id in ids {
                self.log_refresh(self.request_switch_config(id));
            }
        }
        if refresh_inputs {
            info!("input configuration changed on device; refreshing all inputs");
            let ids = self.state.lock().unwrap().valid_input_ids();
            for id in ids {
                self.log_refresh(self.request_input_config(id));
            }
        }
    }

    /// Follow-up refreshes are best-effort: a full queue only delays
    /// convergence until the next notification or reconnect.
    fn log_refresh(&self, result: Result<u64, SessionError>) {
        if let Err(e) = result {
            warn!(error = %e, "could not queue follow-up refresh");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
