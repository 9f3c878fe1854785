//! Command templates for the remote session tool.
//!
//! Every interaction with a machine goes through an external command. The
//! shapes of those commands are configured as templates such as
//! `xpra attach ssh://{machine}/{id}`. A template is split on whitespace
//! into words when it is parsed, and placeholders are substituted per word
//! when it is rendered, so substituted values never get re-split and no
//! shell quoting is involved.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::listing::{SessionListParser, DEFAULT_MARKER};

/// A value that can be substituted into a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Machine name, `{machine}`.
    Machine,
    /// Session id, `{id}`.
    Id,
    /// Preview file path, `{path}`.
    Path,
}

impl Placeholder {
    /// Name as written between braces.
    pub fn name(self) -> &'static str {
        match self {
            Placeholder::Machine => "machine",
            Placeholder::Id => "id",
            Placeholder::Path => "path",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "machine" => Some(Placeholder::Machine),
            "id" => Some(Placeholder::Id),
            "path" => Some(Placeholder::Path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(text) => f.write_str(text),
            Segment::Slot(placeholder) => write!(f, "{{{}}}", placeholder.name()),
        }
    }
}

/// Values available when rendering a template.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandArgs<'a> {
    /// Substituted for `{machine}`.
    pub machine: Option<&'a str>,
    /// Substituted for `{id}`.
    pub id: Option<u32>,
    /// Substituted for `{path}`.
    pub path: Option<&'a Path>,
}

impl<'a> CommandArgs<'a> {
    /// Arguments addressing a whole machine.
    pub fn machine(machine: &'a str) -> Self {
        Self {
            machine: Some(machine),
            ..Default::default()
        }
    }

    /// Arguments addressing one session on a machine.
    pub fn session(machine: &'a str, id: u32) -> Self {
        Self {
            machine: Some(machine),
            id: Some(id),
            path: None,
        }
    }

    /// Adds a preview file path.
    pub fn with_path(mut self, path: &'a Path) -> Self {
        self.path = Some(path);
        self
    }
}

/// A parsed command template.
///
/// Serialized as the template string it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandTemplate {
    source: String,
    words: Vec<Vec<Segment>>,
}

impl CommandTemplate {
    /// Parses a template string.
    pub fn parse(source: &str) -> Result<Self> {
        let words = source
            .split_whitespace()
            .map(|word| parse_word(source, word))
            .collect::<Result<Vec<_>>>()?;

        if words.is_empty() {
            return Err(ProtocolError::EmptyTemplate);
        }

        Ok(Self {
            source: source.to_string(),
            words,
        })
    }

    /// Returns the template as originally written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the template references `placeholder` anywhere.
    pub fn contains(&self, placeholder: Placeholder) -> bool {
        self.words
            .iter()
            .flatten()
            .any(|segment| *segment == Segment::Slot(placeholder))
    }

    /// Checks that every placeholder in `required` is present.
    pub fn require(&self, kind: &'static str, required: &[Placeholder]) -> Result<()> {
        for placeholder in required {
            if !self.contains(*placeholder) {
                return Err(ProtocolError::MissingPlaceholder {
                    kind,
                    template: self.source.clone(),
                    placeholder: placeholder.name(),
                });
            }
        }
        Ok(())
    }

    /// Substitutes `args` into the template.
    pub fn render(&self, args: &CommandArgs<'_>) -> Result<CommandLine> {
        let mut rendered = Vec::with_capacity(self.words.len());

        for word in &self.words {
            let mut out = String::new();
            for segment in word {
                match segment {
                    Segment::Literal(text) => out.push_str(text),
                    Segment::Slot(Placeholder::Machine) => {
                        out.push_str(args.machine.ok_or(ProtocolError::MissingArgument("machine"))?)
                    }
                    Segment::Slot(Placeholder::Id) => {
                        let id = args.id.ok_or(ProtocolError::MissingArgument("id"))?;
                        out.push_str(&id.to_string());
                    }
                    Segment::Slot(Placeholder::Path) => {
                        let path = args.path.ok_or(ProtocolError::MissingArgument("path"))?;
                        out.push_str(&path.to_string_lossy());
                    }
                }
            }
            rendered.push(out);
        }

        let mut iter = rendered.into_iter();
        // parse() guarantees at least one word.
        let program = iter.next().unwrap_or_default();
        Ok(CommandLine {
            program,
            args: iter.collect(),
        })
    }
}

fn parse_word(template: &str, word: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = word;

    while let Some(open) = rest.find('{') {
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| ProtocolError::UnterminatedPlaceholder(template.to_string()))?;
        let name = &after[..close];
        let placeholder =
            Placeholder::from_name(name).ok_or_else(|| ProtocolError::UnknownPlaceholder {
                template: template.to_string(),
                placeholder: name.to_string(),
            })?;
        segments.push(Segment::Slot(placeholder));
        rest = &after[close + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }

    Ok(segments)
}

impl FromStr for CommandTemplate {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CommandTemplate {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CommandTemplate> for String {
    fn from(template: CommandTemplate) -> Self {
        template.source
    }
}

/// A rendered command, ready to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Executable to launch, looked up on `PATH` when not absolute.
    pub program: String,
    /// Arguments, each passed as one argv entry.
    pub args: Vec<String>,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// The full set of commands used to talk to the remote session tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandSet {
    /// Lists sessions on a machine.
    pub list: CommandTemplate,
    /// Attaches a local viewer to a session.
    pub attach: CommandTemplate,
    /// Detaches viewers from a session.
    pub detach: CommandTemplate,
    /// Terminates a session.
    pub kill: CommandTemplate,
    /// Captures a preview image of a session into a file.
    pub screenshot: CommandTemplate,
    /// Text that precedes each session id in the list output.
    pub marker: String,
}

impl Default for CommandSet {
    fn default() -> Self {
        let xpra = |verb: &str, mut rest: Vec<Vec<Segment>>| {
            let mut words = vec![literal("xpra"), literal(verb)];
            words.append(&mut rest);
            builtin(words)
        };

        Self {
            list: builtin(vec![
                literal("ssh"),
                vec![Segment::Slot(Placeholder::Machine)],
                literal("xpra"),
                literal("list"),
            ]),
            attach: xpra("attach", vec![session_url()]),
            detach: xpra("detach", vec![session_url()]),
            kill: xpra("stop", vec![session_url()]),
            screenshot: xpra(
                "screenshot",
                vec![vec![Segment::Slot(Placeholder::Path)], session_url()],
            ),
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

/// Builds a template from words that are already split into segments.
fn builtin(words: Vec<Vec<Segment>>) -> CommandTemplate {
    let source = words
        .iter()
        .map(|word| word.iter().map(Segment::to_string).collect::<String>())
        .collect::<Vec<_>>()
        .join(" ");
    CommandTemplate { source, words }
}

fn literal(text: &str) -> Vec<Segment> {
    vec![Segment::Literal(text.to_string())]
}

/// `ssh://{machine}/{id}`
fn session_url() -> Vec<Segment> {
    vec![
        Segment::Literal("ssh://".to_string()),
        Segment::Slot(Placeholder::Machine),
        Segment::Literal("/".to_string()),
        Segment::Slot(Placeholder::Id),
    ]
}

impl CommandSet {
    /// Checks that every template carries the placeholders its shape needs.
    pub fn validate(&self) -> Result<()> {
        let session = [Placeholder::Machine, Placeholder::Id];

        self.list.require("list", &[Placeholder::Machine])?;
        self.attach.require("attach", &session)?;
        self.detach.require("detach", &session)?;
        self.kill.require("kill", &session)?;
        self.screenshot.require(
            "screenshot",
            &[Placeholder::Machine, Placeholder::Id, Placeholder::Path],
        )?;
        if self.marker.is_empty() {
            return Err(ProtocolError::EmptyMarker);
        }
        Ok(())
    }

    /// Builds the parser for this tool's list output.
    pub fn parser(&self) -> Result<SessionListParser> {
        SessionListParser::new(&self.marker)
    }

    /// Renders the list command for `machine`.
    pub fn list_sessions(&self, machine: &str) -> Result<CommandLine> {
        self.list.render(&CommandArgs::machine(machine))
    }

    /// Renders the attach command for one session.
    pub fn attach(&self, machine: &str, id: u32) -> Result<CommandLine> {
        self.attach.render(&CommandArgs::session(machine, id))
    }

    /// Renders the detach command for one session.
    pub fn detach(&self, machine: &str, id: u32) -> Result<CommandLine> {
        self.detach.render(&CommandArgs::session(machine, id))
    }

    /// Renders the kill command for one session.
    pub fn kill(&self, machine: &str, id: u32) -> Result<CommandLine> {
        self.kill.render(&CommandArgs::session(machine, id))
    }

    /// Renders the screenshot command writing into `path`.
    pub fn screenshot(&self, machine: &str, id: u32, path: &Path) -> Result<CommandLine> {
        self.screenshot
            .render(&CommandArgs::session(machine, id).with_path(path))
    }
}
