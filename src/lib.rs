//! ucc-core: certification test scripts compiled and run against a Wi-Fi testbed
//!
//! A test case is a line-oriented script of `!`-separated records. The
//! compiler resolves variables, includes and compile-time conditionals into
//! a flat command list; the scheduler turns that list into an execution
//! queue whose AP-configuration windows run as fork/join sub-queues; the
//! session drains the queue, talking CAPI to each device over TCP and
//! correlating asynchronous traffic-stream results.
//!
//! # Script Syntax
//!
//! ```text
//! # comment
//! define!$DUT_IF!wlan0!
//! wfa_control_agent_dut!ipaddr=192.168.250.2,port=9000!
//! wfa_control_agent_dut!sta_get_rssi,interface,$DUT_IF!rssi,$rssi!
//! if!$rssi!<!-70!
//! echo!weak signal $rssi!
//! endif!
//! checkthroughput!$rx!10!>=!40!PASS!FAIL!
//! ```
//!
//! # Statements
//!
//! | Statement | Description |
//! |-----------|-------------|
//! | `define!$V!value!` | Bind a variable |
//! | `wfa_test_commands!file!` | Compile another file in place |
//! | `if` / `else` / `endif` | Conditionals, folded at compile time when possible |
//! | `math`, `mexpr`, `cat`, `search`, `append` | Text and arithmetic on variables |
//! | `generate_randnum!$V!lo!hi!` | Random integer |
//! | `sleep`, `pause`, `phase`, `echo`, `info`, `display_name` | Run-time actions |
//! | `external_func!name!args...!` | Call a registered callback |
//! | `result`, `checkthroughput`, `conditional_pass` | Scored checks |
//! | `separator!` | Earlier results no longer count |
//! | `device!command,params!returns!` | CAPI command to a testbed device |

mod actions;
mod command_list;
mod conditions;
mod correlator;
mod devices;
mod engine;
mod error;
mod lexer;
mod ordered;
mod parser;
mod processor;
mod program;
mod runner;
mod scheduler;
mod symbols;
mod task;
mod transport;

pub use actions::{default_actions, Action, ActionCall, ActionEnv, ActionResult, ActionUsage, BoxedAction, ExternalFn};
pub use command_list::{CommandList, CommandNode, Tag};
pub use conditions::{compare_values, CompareOp, Condition};
pub use correlator::{parse_counters, Correlator, Direction, StreamInfo, StreamResult, StreamStatus, StreamTable};
pub use devices::{classify_name, DeviceClass, DeviceRegistry, Testbed};
pub use engine::{Engine, ExecSettings, Session};
pub use error::{ErrorKind, ScriptError};
pub use lexer::{Lexer, Token, TokenKind};
pub use ordered::OrderedMap;
pub use parser::{compile, compile_str, CallTable, ParseOptions};
pub use processor::{evaluate_throughput, throughput_mbps, Response, ResponseStatus};
pub use program::{ProgramConfig, ProgramRegistry};
pub use runner::{parse_assignment, CompiledScript, RunConfig, RunReport, Runner, RunnerBuilder, StreamReport};
pub use scheduler::{ExecutionQueue, QueueEntry, Scheduler, Task, TaskKind, TaskStatus};
pub use symbols::{ConditionalPass, DeviceInfo, ResultTally, RunContext, StopReason, Verdict};
pub use transport::{Connection, ConnectionPool, TransportError, MAX_RESPONSE};
