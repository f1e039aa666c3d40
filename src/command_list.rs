//! Compiled command list
//!
//! The parser appends nodes to one growable list owned by the top-level
//! parse; included files append to the same list. Nodes between two
//! `End` markers form one task group.

use std::fmt;

use crate::ordered::OrderedMap;

/// Node category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// `name`, `host`, `port` of a testbed device definition
    TestbedDevice,
    /// Target device of the following protocol command
    DeviceRef,
    /// `name`, `params`
    CapiCommand,
    /// `binding` of a protocol command's response
    Return,
    /// Local action resolved at run time: `action`, `args` (`!`-joined)
    UccAction,
    /// Deferred conditional: `expr`
    IfCond,
    Else,
    EndIf,
    /// `check` plus check-specific operands
    ResultCheck,
    /// Everything before it is not scored
    Separator,
    /// Closes the current task group
    End,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::TestbedDevice => "TESTBED-DEVICE",
            Tag::DeviceRef => "DEVICE-REF",
            Tag::CapiCommand => "CAPI-COMMAND",
            Tag::Return => "RETURN",
            Tag::UccAction => "UCC-ACTION",
            Tag::IfCond => "IF-COND",
            Tag::Else => "ELSE",
            Tag::EndIf => "ENDIF",
            Tag::ResultCheck => "RESULT-CHECK",
            Tag::Separator => "SEPARATOR",
            Tag::End => "END",
        };
        f.write_str(name)
    }
}

/// One compiled node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandNode {
    pub tag: Tag,
    pub data: OrderedMap<String>,
    /// Index of the task group the node belongs to
    pub group: usize,
    /// Source position, for diagnostics
    pub file: String,
    pub line: usize,
}

impl CommandNode {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// Append-only list of nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandList {
    nodes: Vec<CommandNode>,
    group: usize,
    /// Nodes appended since the last `End`
    open: usize,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<I, K, V>(&mut self, tag: Tag, data: I, file: &str, line: usize)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.nodes.push(CommandNode {
            tag,
            data: data.into_iter().map(|(k, v)| (k, v.into())).collect(),
            group: self.group,
            file: file.to_string(),
            line,
        });
        self.open += 1;
    }

    /// Close the current group. No-op if nothing was appended since the
    /// last `End`, so empty task groups never appear.
    pub fn end_group(&mut self, file: &str, line: usize) -> bool {
        if self.open == 0 {
            return false;
        }
        self.nodes.push(CommandNode {
            tag: Tag::End,
            data: OrderedMap::new(),
            group: self.group,
            file: file.to_string(),
            line,
        });
        self.group += 1;
        self.open = 0;
        true
    }

    pub fn nodes(&self) -> &[CommandNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CommandNode> {
        self.nodes.iter()
    }

    /// Nodes split into task groups at `End` markers (markers dropped).
    pub fn groups(&self) -> Vec<&[CommandNode]> {
        self.nodes
            .split(|n| n.tag == Tag::End)
            .filter(|g| !g.is_empty())
            .collect()
    }
}

impl fmt::Display for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            write!(f, "{:>4} {}", node.group, node.tag)?;
            for (k, v) in node.data.iter() {
                write!(f, " {}={:?}", k, v)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a CommandList {
    type Item = &'a CommandNode;
    type IntoIter = std::slice::Iter<'a, CommandNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
