//! Queue builder
//!
//! Turns the compiled command list into an execution queue. Each group of
//! nodes between END markers becomes one [`Task`].
//!
//! AP configuration commands are batched per access point: while the
//! parallel window is open they go to a private sub-queue for their AP.
//! The window closes, and every open sub-queue is appended to the main
//! queue as one fork entry, when all active APs have committed or when a
//! task arrives that must not overtake them.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::actions;
use crate::command_list::{CommandList, CommandNode, Tag};
use crate::devices::{DeviceClass, DeviceRegistry};
use crate::error::ScriptError;
use crate::ordered::OrderedMap;

/// Command-name fragments that may run concurrently per AP
const PARALLEL_COMMANDS: &[&str] = &[
    "ap_set_",
    "ap_reset_default",
    "ap_config_commit",
    "ap_get_mac_address",
    "ap_get_info",
    "device_get_info",
];

const COMMIT: &str = "ap_config_commit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Local action, never on the wire
    Action,
    /// Protocol command sent to a device
    Command,
    /// `if` / `else` / `endif` evaluated at run time
    Control,
    /// `result`, `checkthroughput`, `conditional_pass`
    Check,
}

/// Outcome of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    Skip,
    Fail,
}

/// The unit of schedulable work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: usize,
    pub kind: TaskKind,
    /// Command, action, control or check name
    pub name: String,
    /// Raw parameter string; `!`-joined operands for actions
    pub params: String,
    /// Destination variable of an action
    pub dest: Option<String>,
    /// Return binding of a protocol command
    pub ret: Option<String>,
    pub device: String,
    /// `host:port`, empty for local tasks
    pub address: String,
    pub class: Option<DeviceClass>,
    pub parallel: bool,
    /// Sub-queue key (AP name)
    pub affinity: String,
    /// Operands of a check
    pub data: OrderedMap<String>,
    /// False for everything before a `separator`
    pub scored: bool,
    pub file: String,
    pub line: usize,
}

impl Task {
    fn new(id: usize, kind: TaskKind, name: impl Into<String>, node: &CommandNode) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            params: String::new(),
            dest: None,
            ret: None,
            device: String::new(),
            address: String::new(),
            class: None,
            parallel: false,
            affinity: String::new(),
            data: OrderedMap::new(),
            scored: true,
            file: node.file.clone(),
            line: node.line,
        }
    }

    /// Wire form of a protocol command
    pub fn render(&self, params: &str) -> String {
        if params.trim().is_empty() {
            format!("{} \r\n", self.name)
        } else {
            format!("{},{} \r\n", self.name, params)
        }
    }

    pub fn is_control(&self) -> bool {
        self.kind == TaskKind::Control
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TaskKind::Command => {
                write!(f, "{} -> {}", self.device, self.name)?;
                if !self.params.is_empty() {
                    write!(f, ",{}", self.params)?;
                }
                Ok(())
            }
            TaskKind::Action => write!(f, "{}!{}", self.name, self.params),
            TaskKind::Control => write!(f, "{} {}", self.name, self.params),
            TaskKind::Check => write!(f, "{}", self.name),
        }
    }
}

/// One entry of a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    Task(Task),
    /// Sub-queues that run concurrently, joined before the next entry
    Fork(Vec<ExecutionQueue>),
}

/// Ordered sequence of tasks, optionally bound to one AP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionQueue {
    pub affinity: Option<String>,
    entries: VecDeque<QueueEntry>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_affinity(name: impl Into<String>) -> Self {
        Self {
            affinity: Some(name.into()),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Tasks in queue order, descending into forks
    pub fn tasks(&self) -> Vec<&Task> {
        let mut out = Vec::new();
        for entry in &self.entries {
            match entry {
                QueueEntry::Task(t) => out.push(t),
                QueueEntry::Fork(subs) => {
                    for sub in subs {
                        out.extend(sub.tasks());
                    }
                }
            }
        }
        out
    }

    fn tasks_mut(&mut self) -> Vec<&mut Task> {
        let mut out = Vec::new();
        for entry in self.entries.iter_mut() {
            match entry {
                QueueEntry::Task(t) => out.push(t),
                QueueEntry::Fork(subs) => {
                    for sub in subs.iter_mut() {
                        out.extend(sub.tasks_mut());
                    }
                }
            }
        }
        out
    }

    fn render_into(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        for entry in &self.entries {
            match entry {
                QueueEntry::Task(t) => writeln!(f, "{:indent$}{}", "", t, indent = indent)?,
                QueueEntry::Fork(subs) => {
                    writeln!(f, "{:indent$}fork", "", indent = indent)?;
                    for sub in subs {
                        writeln!(
                            f,
                            "{:indent$}[{}]",
                            "",
                            sub.affinity.as_deref().unwrap_or("-"),
                            indent = indent + 2
                        )?;
                        sub.render_into(f, indent + 4)?;
                    }
                    writeln!(f, "{:indent$}join", "", indent = indent)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ExecutionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render_into(f, 0)
    }
}

/// True if `name` is on the parallel allow-list.
pub fn is_parallel_command(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    PARALLEL_COMMANDS.iter().any(|p| name.contains(p))
}

/// Value of the `NAME` parameter, the AP a console command configures.
pub fn affinity_of(params: &str) -> Option<String> {
    let fields: Vec<&str> = params.split(',').map(str::trim).collect();
    fields
        .chunks(2)
        .find(|kv| kv[0].eq_ignore_ascii_case("NAME"))
        .and_then(|kv| kv.get(1))
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Builds one execution queue from a command list
pub struct Scheduler<'a> {
    registry: &'a dyn DeviceRegistry,
    is_action: &'a dyn Fn(&str) -> bool,
    main: ExecutionQueue,
    /// Open sub-queues in creation order
    open: Vec<ExecutionQueue>,
    committed: HashSet<String>,
    next_id: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(registry: &'a dyn DeviceRegistry, is_action: &'a dyn Fn(&str) -> bool) -> Self {
        Self {
            registry,
            is_action,
            main: ExecutionQueue::new(),
            open: Vec::new(),
            committed: HashSet::new(),
            next_id: 0,
        }
    }

    pub fn build(mut self, list: &CommandList) -> Result<ExecutionQueue, ScriptError> {
        for group in list.groups() {
            if let Some(task) = self.task_for(group)? {
                self.schedule(task);
            }
            if group.iter().any(|n| n.tag == Tag::Separator) {
                self.flush();
                for task in self.main.tasks_mut() {
                    task.scored = false;
                }
            }
        }
        self.flush();
        Ok(self.main)
    }

    fn schedule(&mut self, task: Task) {
        let active = self.registry.active_aps();
        let parallel = task.kind == TaskKind::Command && task.parallel && !active.is_empty();

        if !parallel {
            let informational = task.kind == TaskKind::Action && actions::is_informational(&task.name);
            if !informational {
                self.flush();
            }
            self.main.push(QueueEntry::Task(task));
            return;
        }

        let key = task.affinity.clone();
        let is_commit = task.name.eq_ignore_ascii_case(COMMIT);
        match self.open.iter_mut().find(|q| q.affinity.as_deref() == Some(key.as_str())) {
            Some(queue) => queue.push(QueueEntry::Task(task)),
            None => {
                tracing::debug!(ap = %key, "parallel window: new sub-queue");
                let mut queue = ExecutionQueue::for_affinity(&key);
                queue.push(QueueEntry::Task(task));
                self.open.push(queue);
            }
        }
        if is_commit {
            self.committed.insert(key);
            if self.committed.len() >= active.len() {
                self.flush();
            }
        }
    }

    /// Move every open sub-queue into the main queue as one fork.
    fn flush(&mut self) {
        if self.open.is_empty() {
            return;
        }
        let subs = std::mem::take(&mut self.open);
        tracing::debug!(queues = subs.len(), "parallel window closed");
        self.main.push(QueueEntry::Fork(subs));
        self.committed.clear();
    }

    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn task_for(&mut self, group: &[CommandNode]) -> Result<Option<Task>, ScriptError> {
        let mut device: Option<&str> = None;
        let mut task: Option<Task> = None;

        for node in group {
            match node.tag {
                Tag::DeviceRef => device = node.get("name"),
                Tag::CapiCommand => {
                    let id = self.next_id();
                    let mut t = Task::new(id, TaskKind::Command, node.get("name").unwrap_or(""), node);
                    t.params = node.get("params").unwrap_or("").to_string();
                    task = Some(t);
                }
                Tag::Return => {
                    if let Some(t) = task.as_mut() {
                        t.ret = node.get("binding").map(str::to_string);
                    }
                }
                Tag::UccAction => {
                    let name = node.get("action").unwrap_or("").to_ascii_lowercase();
                    if !(self.is_action)(&name) {
                        return Err(ScriptError::unknown_command(&name)
                            .with_location(node.file.clone(), node.line));
                    }
                    let id = self.next_id();
                    let mut t = Task::new(id, TaskKind::Action, name, node);
                    t.params = node.get("args").unwrap_or("").to_string();
                    t.dest = node.get("dest").filter(|d| !d.is_empty()).map(str::to_string);
                    task = Some(t);
                }
                Tag::IfCond | Tag::Else | Tag::EndIf => {
                    let name = match node.tag {
                        Tag::IfCond => "if",
                        Tag::Else => "else",
                        _ => "endif",
                    };
                    let id = self.next_id();
                    let mut t = Task::new(id, TaskKind::Control, name, node);
                    t.params = node.get("expr").unwrap_or("").to_string();
                    task = Some(t);
                }
                Tag::ResultCheck => {
                    let id = self.next_id();
                    let mut t = Task::new(id, TaskKind::Check, node.get("check").unwrap_or(""), node);
                    t.data = node.data.clone();
                    task = Some(t);
                }
                Tag::TestbedDevice | Tag::Separator | Tag::End => {}
            }
        }

        let mut task = match task {
            Some(t) => t,
            None => return Ok(None),
        };
        if task.kind != TaskKind::Command {
            return Ok(Some(task));
        }

        let device = match device {
            Some(d) => d,
            None => {
                tracing::warn!(command = %task.name, line = task.line, "protocol command without a device, skipped");
                return Ok(None);
            }
        };
        let address = match self.registry.resolve(device) {
            Some(a) => a,
            None => {
                tracing::warn!(device, command = %task.name, line = task.line, "unresolved device, task skipped");
                return Ok(None);
            }
        };
        task.device = device.to_string();
        task.address = address;
        task.class = self.registry.class_of(device);
        task.parallel = is_parallel_command(&task.name);
        task.affinity = affinity_of(&task.params).unwrap_or_else(|| task.device.clone());
        Ok(Some(task))
    }
}
