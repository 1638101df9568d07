//! FUSE adaptor: presents the device cache as a filesystem tree.
//!
//! Reads come straight from the cache under its mutex. Writes buffer per
//! open handle and are dispatched as queued RPCs on flush — fire-and-forget:
//! the handler returns as soon as the request is queued, and the cache
//! converges when the device answers.
//!
//! Tree layout:
//!
//! ```text
//! /sys_config.json        /mqtt_config.json      /crontab
//! /switch_N_config.json   /input_N_config.json
//! /scripts/script_N.js
//! /proc/switch/N/{output,id,source,apower,voltage,current,freq,
//!                 energy,ret_energy,temperature}
//! /proc/input/N/{id,state}
//! ```

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, warn};

use crate::crontab;
use crate::session::{Session, SessionError};
use crate::state::{DeviceState, SwitchStatus, MAX_INPUTS, MAX_SCRIPTS, MAX_SWITCHES};

const TTL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Inode scheme
// ---------------------------------------------------------------------------

const INO_ROOT: u64 = 1;
const INO_SCRIPTS_DIR: u64 = 2;
const INO_PROC: u64 = 3;
const INO_PROC_SWITCH: u64 = 4;
const INO_PROC_INPUT: u64 = 5;
const INO_SYS_CONFIG: u64 = 6;
const INO_MQTT_CONFIG: u64 = 7;
const INO_CRONTAB: u64 = 8;

const SWITCH_CONFIG_BASE: u64 = 100;
const INPUT_CONFIG_BASE: u64 = 200;
const SCRIPT_BASE: u64 = 300;
const SWITCH_DIR_BASE: u64 = 400;
const INPUT_DIR_BASE: u64 = 500;
const SWITCH_FIELD_BASE: u64 = 1000;
const INPUT_FIELD_BASE: u64 = 2000;
const FIELD_STRIDE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchField {
    Output,
    Id,
    Source,
    Apower,
    Voltage,
    Current,
    Freq,
    Energy,
    RetEnergy,
    Temperature,
}

const SWITCH_FIELDS: [(SwitchField, &str); 10] = [
    (SwitchField::Output, "output"),
    (SwitchField::Id, "id"),
    (SwitchField::Source, "source"),
    (SwitchField::Apower, "apower"),
    (SwitchField::Voltage, "voltage"),
    (SwitchField::Current, "current"),
    (SwitchField::Freq, "freq"),
    (SwitchField::Energy, "energy"),
    (SwitchField::RetEnergy, "ret_energy"),
    (SwitchField::Temperature, "temperature"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputField {
    Id,
    State,
}

const INPUT_FIELDS: [(InputField, &str); 2] = [(InputField::Id, "id"), (InputField::State, "state")];

fn switch_field_index(f: SwitchField) -> u64 {
    SWITCH_FIELDS.iter().position(|(sf, _)| *sf == f).unwrap() as u64
}

fn input_field_index(f: InputField) -> u64 {
    INPUT_FIELDS.iter().position(|(inf, _)| *inf == f).unwrap() as u64
}

/// Everything a path can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Root,
    ScriptsDir,
    ProcDir,
    ProcSwitchDir,
    ProcInputDir,
    SysConfig,
    MqttConfig,
    Crontab,
    SwitchConfig(usize),
    InputConfig(usize),
    Script(usize),
    SwitchDir(usize),
    InputDir(usize),
    SwitchField(usize, SwitchField),
    InputField(usize, InputField),
}

fn ino_of(node: Node) -> u64 {
    match node {
        Node::Root => INO_ROOT,
        Node::ScriptsDir => INO_SCRIPTS_DIR,
        Node::ProcDir => INO_PROC,
        Node::ProcSwitchDir => INO_PROC_SWITCH,
        Node::ProcInputDir => INO_PROC_INPUT,
        Node::SysConfig => INO_SYS_CONFIG,
        Node::MqttConfig => INO_MQTT_CONFIG,
        Node::Crontab => INO_CRONTAB,
        Node::SwitchConfig(id) => SWITCH_CONFIG_BASE + id as u64,
        Node::InputConfig(id) => INPUT_CONFIG_BASE + id as u64,
        Node::Script(id) => SCRIPT_BASE + id as u64,
        Node::SwitchDir(id) => SWITCH_DIR_BASE + id as u64,
        Node::InputDir(id) => INPUT_DIR_BASE + id as u64,
        Node::SwitchField(id, f) => {
            SWITCH_FIELD_BASE + id as u64 * FIELD_STRIDE + switch_field_index(f)
        }
        Node::InputField(id, f) => {
            INPUT_FIELD_BASE + id as u64 * FIELD_STRIDE + input_field_index(f)
        }
    }
}

fn node_of(ino: u64) -> Option<Node> {
    match ino {
        INO_ROOT => Some(Node::Root),
        INO_SCRIPTS_DIR => Some(Node::ScriptsDir),
        INO_PROC => Some(Node::ProcDir),
        INO_PROC_SWITCH => Some(Node::ProcSwitchDir),
        INO_PROC_INPUT => Some(Node::ProcInputDir),
        INO_SYS_CONFIG => Some(Node::SysConfig),
        INO_MQTT_CONFIG => Some(Node::MqttConfig),
        INO_CRONTAB => Some(Node::Crontab),
        n if (SWITCH_CONFIG_BASE..SWITCH_CONFIG_BASE + MAX_SWITCHES as u64).contains(&n) => {
            Some(Node::SwitchConfig((n - SWITCH_CONFIG_BASE) as usize))
        }
        n if (INPUT_CONFIG_BASE..INPUT_CONFIG_BASE + MAX_INPUTS as u64).contains(&n) => {
            Some(Node::InputConfig((n - INPUT_CONFIG_BASE) as usize))
        }
        n if (SCRIPT_BASE..SCRIPT_BASE + MAX_SCRIPTS as u64).contains(&n) => {
            Some(Node::Script((n - SCRIPT_BASE) as usize))
        }
        n if (SWITCH_DIR_BASE..SWITCH_DIR_BASE + MAX_SWITCHES as u64).contains(&n) => {
            Some(Node::SwitchDir((n - SWITCH_DIR_BASE) as usize))
        }
        n if (INPUT_DIR_BASE..INPUT_DIR_BASE + MAX_INPUTS as u64).contains(&n) => {
            Some(Node::InputDir((n - INPUT_DIR_BASE) as usize))
        }
        n if (SWITCH_FIELD_BASE
            ..SWITCH_FIELD_BASE + MAX_SWITCHES as u64 * FIELD_STRIDE)
            .contains(&n) =>
        {
            let rel = n - SWITCH_FIELD_BASE;
            let id = (rel / FIELD_STRIDE) as usize;
            let field = SWITCH_FIELDS.get((rel % FIELD_STRIDE) as usize)?.0;
            Some(Node::SwitchField(id, field))
        }
        n if (INPUT_FIELD_BASE..INPUT_FIELD_BASE + MAX_INPUTS as u64 * FIELD_STRIDE)
            .contains(&n) =>
        {
            let rel = n - INPUT_FIELD_BASE;
            let id = (rel / FIELD_STRIDE) as usize;
            let field = INPUT_FIELDS.get((rel % FIELD_STRIDE) as usize)?.0;
            Some(Node::InputField(id, field))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Name parsing
// ---------------------------------------------------------------------------

fn parse_indexed_name(name: &str, prefix: &str, suffix: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?;
    let digits = rest.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn child_of(parent: Node, name: &str) -> Option<Node> {
    match parent {
        Node::Root => match name {
            "sys_config.json" => Some(Node::SysConfig),
            "mqtt_config.json" => Some(Node::MqttConfig),
            "crontab" => Some(Node::Crontab),
            "scripts" => Some(Node::ScriptsDir),
            "proc" => Some(Node::ProcDir),
            _ => {
                if let Some(id) = parse_indexed_name(name, "switch_", "_config.json") {
                    (id < MAX_SWITCHES).then_some(Node::SwitchConfig(id))
                } else if let Some(id) = parse_indexed_name(name, "input_", "_config.json") {
                    (id < MAX_INPUTS).then_some(Node::InputConfig(id))
                } else {
                    None
                }
            }
        },
        Node::ScriptsDir => {
            let id = parse_indexed_name(name, "script_", ".js")?;
            (id < MAX_SCRIPTS).then_some(Node::Script(id))
        }
        Node::ProcDir => match name {
            "switch" => Some(Node::ProcSwitchDir),
            "input" => Some(Node::ProcInputDir),
            _ => None,
        },
        Node::ProcSwitchDir => {
            let id: usize = name.parse().ok()?;
            (id < MAX_SWITCHES).then_some(Node::SwitchDir(id))
        }
        Node::ProcInputDir => {
            let id: usize = name.parse().ok()?;
            (id < MAX_INPUTS).then_some(Node::InputDir(id))
        }
        Node::SwitchDir(id) => SWITCH_FIELDS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(f, _)| Node::SwitchField(id, *f)),
        Node::InputDir(id) => INPUT_FIELDS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(f, _)| Node::InputField(id, *f)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Content rendering
// ---------------------------------------------------------------------------

fn format_switch_field(status: &SwitchStatus, field: SwitchField) -> String {
    match field {
        SwitchField::Output => format!("{}\n", status.output),
        SwitchField::Id => format!("{}\n", status.id),
        SwitchField::Source => format!("{}\n", status.source),
        SwitchField::Apower => format!("{:.1}\n", status.apower),
        SwitchField::Voltage => format!("{:.1}\n", status.voltage),
        SwitchField::Current => format!("{:.3}\n", status.current),
        SwitchField::Freq => format!("{:.1}\n", status.freq),
        SwitchField::Energy => format!("{:.3}\n", status.energy),
        SwitchField::RetEnergy => format!("{:.3}\n", status.ret_energy),
        SwitchField::Temperature => format!("{:.1}\n", status.temperature_c),
    }
}

fn switch_field_mtime(status: &SwitchStatus, field: SwitchField) -> i64 {
    match field {
        SwitchField::Output => status.mtime_output,
        SwitchField::Id => status.mtime_id,
        SwitchField::Source => status.mtime_source,
        SwitchField::Apower => status.mtime_apower,
        SwitchField::Voltage => status.mtime_voltage,
        SwitchField::Current => status.mtime_current,
        SwitchField::Freq => status.mtime_freq,
        SwitchField::Energy => status.mtime_energy,
        SwitchField::RetEnergy => status.mtime_ret_energy,
        SwitchField::Temperature => status.mtime_temperature,
    }
}

/// Parse a write to a switch `output` file: leading `true`/`1` switches on,
/// `false`/`0` switches off, anything else is invalid.
fn parse_output_write(data: &[u8]) -> Option<bool> {
    let text = String::from_utf8_lossy(data);
    let text = text.trim_start();
    if text.starts_with("true") || text.starts_with('1') {
        Some(true)
    } else if text.starts_with("false") || text.starts_with('0') {
        Some(false)
    } else {
        None
    }
}

fn node_exists(st: &DeviceState, node: Node) -> bool {
    match node {
        Node::Root
        | Node::ScriptsDir
        | Node::ProcDir
        | Node::ProcSwitchDir
        | Node::ProcInputDir
        | Node::Crontab => true,
        Node::SysConfig => st.sys.valid,
        Node::MqttConfig => st.mqtt.valid,
        Node::SwitchConfig(id) | Node::SwitchDir(id) | Node::SwitchField(id, _) => {
            st.switch_is_valid(id)
        }
        Node::InputConfig(id) | Node::InputDir(id) | Node::InputField(id, _) => {
            st.input_is_valid(id)
        }
        Node::Script(id) => st.script_is_valid(id),
    }
}

fn node_content(st: &DeviceState, node: Node) -> Option<Vec<u8>> {
    match node {
        Node::SysConfig => st.sys_config_json().map(String::into_bytes),
        Node::MqttConfig => st.mqtt_config_json().map(String::into_bytes),
        Node::Crontab => Some(crontab::render(&st.schedules).into_bytes()),
        Node::SwitchConfig(id) => st.switch_config_json(id).map(String::into_bytes),
        Node::InputConfig(id) => st.input_config_json(id).map(String::into_bytes),
        Node::Script(id) => st
            .script_is_valid(id)
            .then(|| st.script_code(id).unwrap_or_default().into_bytes()),
        Node::SwitchField(id, field) => {
            let slot = st.switches.get(id).filter(|s| s.valid)?;
            Some(format_switch_field(&slot.status, field).into_bytes())
        }
        Node::InputField(id, field) => {
            let slot = st.inputs.get(id).filter(|s| s.valid)?;
            let text = match field {
                InputField::Id => format!("{}\n", slot.status.id),
                InputField::State => format!("{}\n", slot.status.state),
            };
            Some(text.into_bytes())
        }
        _ => None,
    }
}

fn node_mtime(st: &DeviceState, node: Node) -> i64 {
    match node {
        Node::SysConfig => st.sys.last_update,
        Node::MqttConfig => st.mqtt.last_update,
        Node::Crontab => st.schedules.last_update,
        Node::SwitchConfig(id) | Node::SwitchDir(id) => {
            st.switches.get(id).map(|s| s.last_update).unwrap_or(0)
        }
        Node::InputConfig(id) | Node::InputDir(id) => {
            st.inputs.get(id).map(|s| s.last_update).unwrap_or(0)
        }
        Node::Script(id) => st.scripts.get(id).map(|s| s.modify_time).unwrap_or(0),
        Node::SwitchField(id, field) => st
            .switches
            .get(id)
            .map(|s| switch_field_mtime(&s.status, field))
            .unwrap_or(0),
        Node::InputField(id, field) => st
            .inputs
            .get(id)
            .map(|s| match field {
                InputField::Id => s.status.mtime_id,
                InputField::State => s.status.mtime_state,
            })
            .unwrap_or(0),
        _ => 0,
    }
}

fn node_kind(node: Node) -> FileType {
    match node {
        Node::Root
        | Node::ScriptsDir
        | Node::ProcDir
        | Node::ProcSwitchDir
        | Node::ProcInputDir
        | Node::SwitchDir(_)
        | Node::InputDir(_) => FileType::Directory,
        _ => FileType::RegularFile,
    }
}

fn node_perm(node: Node) -> u16 {
    match node {
        _ if node_kind(node) == FileType::Directory => 0o755,
        Node::Crontab => 0o644,
        Node::SwitchField(_, SwitchField::Output) => 0o664,
        Node::SwitchField(..) | Node::InputField(..) => 0o444,
        _ => 0o664,
    }
}

/// What a buffered write handle flushes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    SysConfig,
    MqttConfig,
    SwitchConfig(usize),
    InputConfig(usize),
    Script(usize),
    Crontab,
}

fn write_kind(node: Node) -> Option<WriteKind> {
    match node {
        Node::SysConfig => Some(WriteKind::SysConfig),
        Node::MqttConfig => Some(WriteKind::MqttConfig),
        Node::SwitchConfig(id) => Some(WriteKind::SwitchConfig(id)),
        Node::InputConfig(id) => Some(WriteKind::InputConfig(id)),
        Node::Script(id) => Some(WriteKind::Script(id)),
        Node::Crontab => Some(WriteKind::Crontab),
        _ => None,
    }
}

fn errno_of(e: &SessionError) -> i32 {
    match e {
        SessionError::QueueFull(_) => libc::EIO,
        SessionError::InvalidJson(_) => libc::EINVAL,
        SessionError::NoSuchInstance { .. } => libc::ENOENT,
        SessionError::CodeTooLarge(_) => libc::EFBIG,
    }
}

// ---------------------------------------------------------------------------
// Filesystem implementation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct OpenFile {
    ino: u64,
    kind: WriteKind,
    buffer: Vec<u8>,
    dirty: bool,
}

pub struct ShellyFs {
    session: Session,
    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
}

impl ShellyFs {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn attr_of(&self, node: Node, uid: u32, gid: u32) -> Option<FileAttr> {
        let (size, mtime) = {
            let st = self.session.state().lock().unwrap();
            if !node_exists(&st, node) {
                return None;
            }
            let size = node_content(&st, node).map(|c| c.len() as u64).unwrap_or(0);
            (size, node_mtime(&st, node))
        };

        let kind = node_kind(node);
        let time = UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64);
        Some(FileAttr {
            ino: ino_of(node),
            size,
            blocks: size.div_ceil(512),
            atime: time,
            mtime: time,
            ctime: time,
            crtime: time,
            kind,
            perm: node_perm(node),
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid,
            gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        })
    }

    /// Queue the RPCs for a flushed write buffer.
    fn dispatch_write(&self, kind: WriteKind, content: &[u8]) -> Result<(), i32> {
        let text = String::from_utf8_lossy(content);
        let result = match kind {
            WriteKind::SysConfig => self.session.set_sys_config_json(&text).map(|_| ()),
            WriteKind::MqttConfig => self.session.set_mqtt_config_json(&text).map(|_| ()),
            WriteKind::SwitchConfig(id) => {
                self.session.set_switch_config_json(id, &text).map(|_| ())
            }
            WriteKind::InputConfig(id) => self.session.set_input_config_json(id, &text).map(|_| ()),
            WriteKind::Script(id) => self.session.put_script_code(id, &text).map(|_| ()),
            WriteKind::Crontab => self.session.sync_crontab(&text).map(|_| ()),
        };

        result.map_err(|e| {
            warn!(error = %e, "write rejected");
            errno_of(&e)
        })
    }

    fn flush_handle(&mut self, fh: u64) -> Result<(), i32> {
        let Some(handle) = self.handles.get_mut(&fh) else {
            return Ok(());
        };
        if !handle.dirty || handle.buffer.is_empty() {
            return Ok(());
        }
        handle.dirty = false;
        let kind = handle.kind;
        let content = std::mem::take(&mut handle.buffer);
        self.dispatch_write(kind, &content)
    }

    fn readdir_entries(&self, node: Node) -> Option<Vec<(u64, FileType, String)>> {
        let parent = match node {
            Node::Root | Node::ScriptsDir | Node::ProcDir => INO_ROOT,
            Node::ProcSwitchDir | Node::ProcInputDir => INO_PROC,
            Node::SwitchDir(_) => INO_PROC_SWITCH,
            Node::InputDir(_) => INO_PROC_INPUT,
            _ => return None,
        };

        let st = self.session.state().lock().unwrap();
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino_of(node), FileType::Directory, ".".into()),
            (parent, FileType::Directory, "..".into()),
        ];

        match node {
            Node::Root => {
                if st.sys.valid {
                    entries.push((INO_SYS_CONFIG, FileType::RegularFile, "sys_config.json".into()));
                }
                if st.mqtt.valid {
                    entries.push((
                        INO_MQTT_CONFIG,
                        FileType::RegularFile,
                        "mqtt_config.json".into(),
                    ));
                }
                entries.push((INO_CRONTAB, FileType::RegularFile, "crontab".into()));
                for id in st.valid_switch_ids() {
                    entries.push((
                        ino_of(Node::SwitchConfig(id)),
                        FileType::RegularFile,
                        format!("switch_{id}_config.json"),
                    ));
                }
                for id in st.valid_input_ids() {
                    entries.push((
                        ino_of(Node::InputConfig(id)),
                        FileType::RegularFile,
                        format!("input_{id}_config.json"),
                    ));
                }
                entries.push((INO_SCRIPTS_DIR, FileType::Directory, "scripts".into()));
                entries.push((INO_PROC, FileType::Directory, "proc".into()));
            }
            Node::ScriptsDir => {
                for id in st.valid_script_ids() {
                    entries.push((
                        ino_of(Node::Script(id)),
                        FileType::RegularFile,
                        format!("script_{id}.js"),
                    ));
                }
            }
            Node::ProcDir => {
                entries.push((INO_PROC_SWITCH, FileType::Directory, "switch".into()));
                entries.push((INO_PROC_INPUT, FileType::Directory, "input".into()));
            }
            Node::ProcSwitchDir => {
                for id in st.valid_switch_ids() {
                    entries.push((
                        ino_of(Node::SwitchDir(id)),
                        FileType::Directory,
                        id.to_string(),
                    ));
                }
            }
            Node::ProcInputDir => {
                for id in st.valid_input_ids() {
                    entries.push((
                        ino_of(Node::InputDir(id)),
                        FileType::Directory,
                        id.to_string(),
                    ));
                }
            }
            Node::SwitchDir(id) => {
                if !st.switch_is_valid(id) {
                    return None;
                }
                for (field, name) in SWITCH_FIELDS {
                    entries.push((
                        ino_of(Node::SwitchField(id, field)),
                        FileType::RegularFile,
                        name.to_string(),
                    ));
                }
            }
            Node::InputDir(id) => {
                if !st.input_is_valid(id) {
                    return None;
                }
                for (field, name) in INPUT_FIELDS {
                    entries.push((
                        ino_of(Node::InputField(id, field)),
                        FileType::RegularFile,
                        name.to_string(),
                    ));
                }
            }
            _ => return None,
        }

        Some(entries)
    }
}

impl Filesystem for ShellyFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_node) = node_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(node) = child_of(parent_node, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_of(node, req.uid(), req.gid()) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_of(node, req.uid(), req.gid()) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // Truncation only matters for the write buffers; the cache itself is
        // device-owned.
        if let Some(size) = size {
            match fh {
                Some(fh) => {
                    if let Some(handle) = self.handles.get_mut(&fh) {
                        handle.buffer.truncate(size as usize);
                    }
                }
                None => {
                    for handle in self.handles.values_mut().filter(|h| h.ino == ino) {
                        handle.buffer.truncate(size as usize);
                    }
                }
            }
        }

        match self.attr_of(node, req.uid(), req.gid()) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(entries) = self.readdir_entries(node) else {
            reply.error(libc::ENOTDIR);
            return;
        };

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let writable_open = flags & libc::O_ACCMODE != libc::O_RDONLY;
        if !writable_open {
            reply.opened(0, 0);
            return;
        }

        // Switch output writes act immediately in write(); everything else
        // buffers until flush.
        if matches!(node, Node::SwitchField(_, SwitchField::Output)) {
            reply.opened(0, 0);
            return;
        }

        let Some(kind) = write_kind(node) else {
            reply.error(libc::EACCES);
            return;
        };

        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(
            fh,
            OpenFile {
                ino,
                kind,
                buffer: Vec::new(),
                dirty: false,
            },
        );
        debug!(ino, fh, "opened for writing");
        reply.opened(fh, 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let content = {
            let st = self.session.state().lock().unwrap();
            node_content(&st, node)
        };
        let Some(content) = content else {
            reply.error(libc::ENOENT);
            return;
        };

        let start = (offset.max(0) as usize).min(content.len());
        let end = (start + size as usize).min(content.len());
        reply.data(&content[start..end]);
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // Switch output control: parsed and queued right away.
        if let Node::SwitchField(id, SwitchField::Output) = node {
            let Some(on) = parse_output_write(data) else {
                reply.error(libc::EINVAL);
                return;
            };
            match self.session.set_switch(id, on) {
                Ok(_) => reply.written(data.len() as u32),
                Err(e) => reply.error(errno_of(&e)),
            }
            return;
        }

        let Some(handle) = self.handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let offset = offset.max(0) as usize;
        if handle.buffer.len() < offset + data.len() {
            handle.buffer.resize(offset + data.len(), 0);
        }
        handle.buffer[offset..offset + data.len()].copy_from_slice(data);
        handle.dirty = true;
        reply.written(data.len() as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.flush_handle(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // Last chance to dispatch if no flush arrived.
        let result = self.flush_handle(fh);
        self.handles.remove(&fh);
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }
}

/// Mount in the background; dropping the returned session unmounts.
pub fn spawn_mount(
    session: Session,
    mountpoint: &Path,
) -> std::io::Result<fuser::BackgroundSession> {
    let options = [
        MountOption::FSName("shusefs".to_string()),
        MountOption::DefaultPermissions,
    ];
    fuser::spawn_mount2(ShellyFs::new(session), mountpoint, &options)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RequestQueue;
    use crate::state;
    use serde_json::json;
    use std::sync::Arc;

    fn test_fs() -> ShellyFs {
        let session = Session::new(state::shared(), Arc::new(RequestQueue::new()));
        ShellyFs::new(session)
    }

    // -- inode mapping -------------------------------------------------------

    #[test]
    fn every_node_round_trips_through_its_inode() {
        let nodes = [
            Node::Root,
            Node::ScriptsDir,
            Node::ProcDir,
            Node::ProcSwitchDir,
            Node::ProcInputDir,
            Node::SysConfig,
            Node::MqttConfig,
            Node::Crontab,
            Node::SwitchConfig(0),
            Node::SwitchConfig(15),
            Node::InputConfig(7),
            Node::Script(9),
            Node::SwitchDir(3),
            Node::InputDir(15),
            Node::SwitchField(0, SwitchField::Output),
            Node::SwitchField(15, SwitchField::Temperature),
            Node::InputField(2, InputField::State),
        ];
        for node in nodes {
            assert_eq!(node_of(ino_of(node)), Some(node), "{node:?}");
        }
    }

    #[test]
    fn inodes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for id in 0..MAX_SWITCHES {
            assert!(seen.insert(ino_of(Node::SwitchConfig(id))));
            assert!(seen.insert(ino_of(Node::SwitchDir(id))));
            for (field, _) in SWITCH_FIELDS {
                assert!(seen.insert(ino_of(Node::SwitchField(id, field))));
            }
        }
        for id in 0..MAX_INPUTS {
            assert!(seen.insert(ino_of(Node::InputConfig(id))));
            assert!(seen.insert(ino_of(Node::InputDir(id))));
            for (field, _) in INPUT_FIELDS {
                assert!(seen.insert(ino_of(Node::InputField(id, field))));
            }
        }
        for id in 0..MAX_SCRIPTS {
            assert!(seen.insert(ino_of(Node::Script(id))));
        }
    }

    #[test]
    fn unknown_inode_resolves_to_none() {
        assert_eq!(node_of(99_999), None);
        assert_eq!(node_of(0), None);
    }

    // -- name resolution -----------------------------------------------------

    #[test]
    fn root_children_resolve() {
        assert_eq!(child_of(Node::Root, "sys_config.json"), Some(Node::SysConfig));
        assert_eq!(child_of(Node::Root, "crontab"), Some(Node::Crontab));
        assert_eq!(
            child_of(Node::Root, "switch_3_config.json"),
            Some(Node::SwitchConfig(3))
        );
        assert_eq!(
            child_of(Node::Root, "input_15_config.json"),
            Some(Node::InputConfig(15))
        );
        assert_eq!(child_of(Node::Root, "switch_16_config.json"), None);
        assert_eq!(child_of(Node::Root, "switch_x_config.json"), None);
        assert_eq!(child_of(Node::Root, "nope.txt"), None);
    }

    #[test]
    fn proc_tree_resolves() {
        assert_eq!(child_of(Node::ProcDir, "switch"), Some(Node::ProcSwitchDir));
        assert_eq!(child_of(Node::ProcSwitchDir, "2"), Some(Node::SwitchDir(2)));
        assert_eq!(
            child_of(Node::SwitchDir(2), "apower"),
            Some(Node::SwitchField(2, SwitchField::Apower))
        );
        assert_eq!(
            child_of(Node::InputDir(0), "state"),
            Some(Node::InputField(0, InputField::State))
        );
        assert_eq!(child_of(Node::SwitchDir(2), "bogus"), None);
        assert_eq!(child_of(Node::ProcSwitchDir, "16"), None);
    }

    #[test]
    fn script_names_resolve() {
        assert_eq!(child_of(Node::ScriptsDir, "script_0.js"), Some(Node::Script(0)));
        assert_eq!(child_of(Node::ScriptsDir, "script_9.js"), Some(Node::Script(9)));
        assert_eq!(child_of(Node::ScriptsDir, "script_10.js"), None);
        assert_eq!(child_of(Node::ScriptsDir, "script_.js"), None);
    }

    // -- value formatting ----------------------------------------------------

    #[test]
    fn switch_field_formats_match_contract() {
        let status = SwitchStatus {
            output: true,
            id: 2,
            source: "WS_in".into(),
            apower: 7.2,
            voltage: 230.4,
            current: 0.031,
            freq: 50.0,
            energy: 1234.568,
            ret_energy: 0.5,
            temperature_c: 41.3,
            ..Default::default()
        };

        assert_eq!(format_switch_field(&status, SwitchField::Output), "true\n");
        assert_eq!(format_switch_field(&status, SwitchField::Id), "2\n");
        assert_eq!(format_switch_field(&status, SwitchField::Source), "WS_in\n");
        assert_eq!(format_switch_field(&status, SwitchField::Apower), "7.2\n");
        assert_eq!(format_switch_field(&status, SwitchField::Voltage), "230.4\n");
        assert_eq!(format_switch_field(&status, SwitchField::Current), "0.031\n");
        assert_eq!(format_switch_field(&status, SwitchField::Freq), "50.0\n");
        assert_eq!(format_switch_field(&status, SwitchField::Energy), "1234.568\n");
        assert_eq!(format_switch_field(&status, SwitchField::RetEnergy), "0.500\n");
        assert_eq!(
            format_switch_field(&status, SwitchField::Temperature),
            "41.3\n"
        );
    }

    // -- output writes -------------------------------------------------------

    #[test]
    fn output_write_parses_truthy_and_falsy_prefixes() {
        assert_eq!(parse_output_write(b"true"), Some(true));
        assert_eq!(parse_output_write(b"true\n"), Some(true));
        assert_eq!(parse_output_write(b"1"), Some(true));
        assert_eq!(parse_output_write(b"false\n"), Some(false));
        assert_eq!(parse_output_write(b"0"), Some(false));
        assert_eq!(parse_output_write(b"  1\n"), Some(true));
        assert_eq!(parse_output_write(b"toggle"), None);
        assert_eq!(parse_output_write(b""), None);
    }

    // -- permissions ---------------------------------------------------------

    #[test]
    fn permissions_match_surface_contract() {
        assert_eq!(node_perm(Node::SysConfig), 0o664);
        assert_eq!(node_perm(Node::MqttConfig), 0o664);
        assert_eq!(node_perm(Node::Crontab), 0o644);
        assert_eq!(node_perm(Node::SwitchConfig(0)), 0o664);
        assert_eq!(node_perm(Node::Script(1)), 0o664);
        assert_eq!(node_perm(Node::SwitchField(0, SwitchField::Output)), 0o664);
        assert_eq!(node_perm(Node::SwitchField(0, SwitchField::Apower)), 0o444);
        assert_eq!(node_perm(Node::InputField(0, InputField::State)), 0o444);
        assert_eq!(node_perm(Node::Root), 0o755);
    }

    // -- content & visibility ------------------------------------------------

    #[test]
    fn invalid_instances_are_invisible() {
        let fs = test_fs();
        let st = fs.session.state().lock().unwrap();
        assert!(!node_exists(&st, Node::SysConfig));
        assert!(!node_exists(&st, Node::SwitchConfig(0)));
        assert!(!node_exists(&st, Node::SwitchField(0, SwitchField::Output)));
        assert!(node_exists(&st, Node::Crontab));
        assert!(node_exists(&st, Node::Root));
    }

    #[test]
    fn proc_field_content_reflects_cache() {
        let fs = test_fs();
        {
            let mut st = fs.session.state().lock().unwrap();
            st.update_switch_config(0, &json!({"name": "sw"}), 1);
            st.apply_switch_status(0, &json!({"output": true, "apower": 12.34}), 2);
        }
        let st = fs.session.state().lock().unwrap();
        assert_eq!(
            node_content(&st, Node::SwitchField(0, SwitchField::Output)),
            Some(b"true\n".to_vec())
        );
        assert_eq!(
            node_content(&st, Node::SwitchField(0, SwitchField::Apower)),
            Some(b"12.3\n".to_vec())
        );
    }

    #[test]
    fn proc_field_mtime_is_per_field() {
        let fs = test_fs();
        {
            let mut st = fs.session.state().lock().unwrap();
            st.update_switch_config(0, &json!({"name": "sw"}), 1);
            st.apply_switch_status(0, &json!({"apower": 1.0, "voltage": 230.0}), 100);
            st.apply_switch_status(0, &json!({"apower": 2.0}), 200);
        }
        let st = fs.session.state().lock().unwrap();
        assert_eq!(node_mtime(&st, Node::SwitchField(0, SwitchField::Apower)), 200);
        assert_eq!(node_mtime(&st, Node::SwitchField(0, SwitchField::Voltage)), 100);
    }

    #[test]
    fn script_without_code_reads_empty() {
        let fs = test_fs();
        {
            let mut st = fs.session.state().lock().unwrap();
            st.load_script_list(&json!({"scripts": [{"id": 1, "name": "a.js"}]}), 0);
        }
        let st = fs.session.state().lock().unwrap();
        assert_eq!(node_content(&st, Node::Script(1)), Some(Vec::new()));
        assert_eq!(node_content(&st, Node::Script(2)), None);
    }

    #[test]
    fn readdir_lists_only_valid_instances() {
        let fs = test_fs();
        {
            let mut st = fs.session.state().lock().unwrap();
            st.update_switch_config(1, &json!({"name": "sw"}), 0);
            st.update_input_config(0, &json!({"name": "in"}), 0);
        }

        let names: Vec<String> = fs
            .readdir_entries(Node::Root)
            .unwrap()
            .into_iter()
            .map(|(_, _, name)| name)
            .collect();
        assert!(names.contains(&"switch_1_config.json".to_string()));
        assert!(!names.contains(&"switch_0_config.json".to_string()));
        assert!(names.contains(&"input_0_config.json".to_string()));
        // No sys/mqtt config yet.
        assert!(!names.contains(&"sys_config.json".to_string()));
        assert!(names.contains(&"crontab".to_string()));

        let proc_names: Vec<String> = fs
            .readdir_entries(Node::ProcSwitchDir)
            .unwrap()
            .into_iter()
            .map(|(_, _, name)| name)
            .collect();
        assert_eq!(proc_names, vec![".", "..", "1"]);
    }

    #[test]
    fn dispatch_write_maps_errors_to_errno() {
        let fs = test_fs();
        // Invalid JSON into a config file.
        let err = fs
            .dispatch_write(WriteKind::MqttConfig, br#"{"enable":maybe}"#)
            .unwrap_err();
        assert_eq!(err, libc::EINVAL);
        // Nothing reached the queue.
        assert!(fs.session.queue().is_empty());

        // Script upload to an unknown slot.
        let err = fs.dispatch_write(WriteKind::Script(0), b"x").unwrap_err();
        assert_eq!(err, libc::ENOENT);
    }

    #[test]
    fn dispatch_write_queues_config_set() {
        let fs = test_fs();
        fs.dispatch_write(WriteKind::SysConfig, br#"{"device":{"name":"n"}}"#)
            .unwrap();
        let (_, payload) = fs.session.queue().next_to_send().unwrap();
        assert!(payload.contains("Sys.SetConfig"));
    }
}
