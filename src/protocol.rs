//! Per-device-type protocol definition.
//!
//! A [`ProtocolBuilder`] is run once per device type to declare state
//! variables, poll requests, response rules and commands. The resulting
//! [`Protocol`] is immutable and is handed to every engine driving a device of
//! that type.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LinkError;
use crate::matcher::{ErrorText, Matcher, Message, ResponseMatcher, ResponseRule, RuleKind};
use crate::scheduler::{PollRequest, RequestScheduler};
use crate::state::DeviceStateModel;
use crate::value::{Value, VarType};

/// Renders a command payload from caller arguments.
pub type PayloadBuilder = Arc<dyn Fn(&[Value]) -> Result<Vec<u8>, LinkError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Terminator-delimited lines.
    Text,
    /// Checksummed binary frames.
    Binary,
}

pub struct CommandSpec {
    pub key: String,
    pub expected_response: Option<String>,
    pub expect_reply: bool,
    build: PayloadBuilder,
}

impl CommandSpec {
    pub fn build_payload(&self, args: &[Value]) -> Result<Vec<u8>, LinkError> {
        (self.build)(args)
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("key", &self.key)
            .field("expected_response", &self.expected_response)
            .field("expect_reply", &self.expect_reply)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct VarDecl {
    name: String,
    var_type: VarType,
    editable: bool,
}

#[derive(Debug)]
pub struct Protocol {
    name: String,
    framing: Framing,
    vars: Vec<VarDecl>,
    polls: Vec<PollRequest>,
    matcher: ResponseMatcher,
    commands: HashMap<String, CommandSpec>,
}

impl Protocol {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    #[must_use]
    pub const fn matcher(&self) -> &ResponseMatcher {
        &self.matcher
    }

    #[must_use]
    pub fn polls(&self) -> &[PollRequest] {
        &self.polls
    }

    /// Fresh scheduler over this protocol's polls; each engine owns its own cursor.
    pub fn scheduler(&self) -> Result<RequestScheduler, LinkError> {
        RequestScheduler::new(self.polls.clone())
    }

    /// Look up a command by key.
    pub fn command(&self, key: &str) -> Result<&CommandSpec, LinkError> {
        self.commands
            .get(key)
            .ok_or_else(|| LinkError::UnknownCommand(key.to_string()))
    }

    pub fn command_keys(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// State model holding every declared variable, all unknown.
    pub fn new_state(&self) -> Result<DeviceStateModel, LinkError> {
        let mut state = DeviceStateModel::new();
        for v in &self.vars {
            state.declare(v.name.clone(), v.var_type.clone(), v.editable)?;
        }
        Ok(state)
    }
}

/// Name of the command generated for a managed state variable.
#[must_use]
pub fn setter_key(var: &str) -> String {
    format!("set_{var}")
}

pub struct ProtocolBuilder {
    name: String,
    framing: Framing,
    vars: Vec<VarDecl>,
    polls: Vec<PollRequest>,
    rules: Vec<ResponseRule>,
    commands: HashMap<String, CommandSpec>,
}

impl ProtocolBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>, framing: Framing) -> Self {
        Self {
            name: name.into(),
            framing,
            vars: Vec::new(),
            polls: Vec::new(),
            rules: Vec::new(),
            commands: HashMap::new(),
        }
    }

    /// Declare an editable state variable.
    #[must_use]
    pub fn state_var(mut self, name: impl Into<String>, var_type: VarType) -> Self {
        self.vars.push(VarDecl {
            name: name.into(),
            var_type,
            editable: true,
        });
        self
    }

    /// Declare a variable only the device can change.
    #[must_use]
    pub fn read_only_var(mut self, name: impl Into<String>, var_type: VarType) -> Self {
        self.vars.push(VarDecl {
            name: name.into(),
            var_type,
            editable: false,
        });
        self
    }

    /// Declare an editable variable together with its `set_<name>` command,
    /// answered by the `response` rule.
    pub fn managed_var<F>(
        self,
        name: &str,
        var_type: VarType,
        response: &str,
        action: F,
    ) -> Result<Self, LinkError>
    where
        F: Fn(&Value) -> Result<Vec<u8>, LinkError> + Send + Sync + 'static,
    {
        let var = name.to_string();
        let checked = var_type.clone();
        self.state_var(name, var_type).command_expecting(
            &setter_key(name),
            response,
            move |args: &[Value]| {
                let value = args.first().ok_or_else(|| {
                    LinkError::Protocol(format!("set_{var} needs a value argument"))
                })?;
                if value.is_null() || !checked.accepts(value) {
                    return Err(LinkError::TypeMismatch {
                        name: var.clone(),
                        expected: checked.name().to_string(),
                    });
                }
                action(value)
            },
        )
    }

    pub fn poll(
        mut self,
        key: &str,
        payload: impl Into<Vec<u8>>,
        frequency: f64,
    ) -> Result<Self, LinkError> {
        self.polls.push(PollRequest::new(key, payload, frequency)?);
        Ok(self)
    }

    /// A poll that only the `response` rule may answer.
    pub fn poll_expecting(
        mut self,
        key: &str,
        payload: impl Into<Vec<u8>>,
        frequency: f64,
        response: &str,
    ) -> Result<Self, LinkError> {
        self.polls
            .push(PollRequest::new(key, payload, frequency)?.with_expected_response(response));
        Ok(self)
    }

    #[must_use]
    pub fn on_response<F>(mut self, key: &str, matcher: Matcher, interpreter: F) -> Self
    where
        F: Fn(&Message, &mut DeviceStateModel) -> Result<Value, LinkError> + Send + Sync + 'static,
    {
        self.rules.push(ResponseRule {
            key: key.to_string(),
            matcher,
            kind: RuleKind::value(interpreter),
        });
        self
    }

    #[must_use]
    pub fn ack(mut self, matcher: Matcher) -> Self {
        self.rules.push(ResponseRule {
            key: "ack".into(),
            matcher,
            kind: RuleKind::Ack,
        });
        self
    }

    #[must_use]
    pub fn nack(mut self, matcher: Matcher) -> Self {
        self.rules.push(ResponseRule {
            key: "nack".into(),
            matcher,
            kind: RuleKind::Nack,
        });
        self
    }

    #[must_use]
    pub fn error(mut self, key: &str, matcher: Matcher, text: ErrorText) -> Self {
        self.rules.push(ResponseRule {
            key: key.to_string(),
            matcher,
            kind: RuleKind::Error(text),
        });
        self
    }

    /// Register a command whose reply may come from any rule.
    pub fn command<F>(self, key: &str, build: F) -> Result<Self, LinkError>
    where
        F: Fn(&[Value]) -> Result<Vec<u8>, LinkError> + Send + Sync + 'static,
    {
        self.insert_command(key, None, true, Arc::new(build))
    }

    pub fn command_expecting<F>(self, key: &str, response: &str, build: F) -> Result<Self, LinkError>
    where
        F: Fn(&[Value]) -> Result<Vec<u8>, LinkError> + Send + Sync + 'static,
    {
        self.insert_command(key, Some(response.to_string()), true, Arc::new(build))
    }

    /// A command the device never answers; it completes once written.
    pub fn command_no_reply<F>(self, key: &str, build: F) -> Result<Self, LinkError>
    where
        F: Fn(&[Value]) -> Result<Vec<u8>, LinkError> + Send + Sync + 'static,
    {
        self.insert_command(key, None, false, Arc::new(build))
    }

    fn insert_command(
        mut self,
        key: &str,
        expected_response: Option<String>,
        expect_reply: bool,
        build: PayloadBuilder,
    ) -> Result<Self, LinkError> {
        if self.commands.contains_key(key) {
            return Err(LinkError::Config(format!("command {key} registered twice")));
        }
        self.commands.insert(
            key.to_string(),
            CommandSpec {
                key: key.to_string(),
                expected_response,
                expect_reply,
                build,
            },
        );
        Ok(self)
    }

    /// Validate cross references and freeze the definition.
    pub fn build(self) -> Result<Protocol, LinkError> {
        let matcher = ResponseMatcher::new(self.rules);
        let expected = self
            .polls
            .iter()
            .filter_map(|p| p.expected_response.as_deref())
            .chain(
                self.commands
                    .values()
                    .filter_map(|c| c.expected_response.as_deref()),
            );
        for key in expected {
            if !matcher.contains_key(key) {
                return Err(LinkError::Config(format!(
                    "{}: no response rule named {key}",
                    self.name
                )));
            }
        }
        let protocol = Protocol {
            name: self.name,
            framing: self.framing,
            vars: self.vars,
            polls: self.polls,
            matcher,
            commands: self.commands,
        };
        // duplicate variables and impossible schedules surface here, not at runtime
        protocol.new_state()?;
        protocol.scheduler()?;
        Ok(protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switcher() -> ProtocolBuilder {
        ProtocolBuilder::new("test switcher", Framing::Text)
            .on_response("channel", Matcher::regex(r"Chn\d").expect("re"), |m, state| {
                let Message::Line(line) = m else {
                    return Ok(Value::Null);
                };
                let ch = line.trim_start_matches("Chn").to_string();
                state.update("input", ch.clone())?;
                Ok(Value::from(ch))
            })
    }

    #[test]
    fn managed_var_registers_setter() {
        let p = switcher()
            .managed_var(
                "input",
                VarType::Option(vec!["1".into(), "2".into()]),
                "channel",
                |v| Ok(format!("{v}!\r\n").into_bytes()),
            )
            .expect("managed var")
            .build()
            .expect("build");
        let cmd = p.command("set_input").expect("setter");
        assert_eq!(cmd.expected_response.as_deref(), Some("channel"));
        assert_eq!(cmd.build_payload(&[Value::from("2")]).expect("payload"), b"2!\r\n");
        assert!(matches!(
            cmd.build_payload(&[Value::from("7")]),
            Err(LinkError::TypeMismatch { .. })
        ));
        assert!(cmd.build_payload(&[]).is_err());
        let state = p.new_state().expect("state");
        assert!(state.variable("input").is_some_and(|v| v.editable));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let p = switcher().build().expect("build");
        assert!(matches!(p.command("reboot"), Err(LinkError::UnknownCommand(_))));
    }

    #[test]
    fn dangling_expected_response_fails_build() {
        let r = ProtocolBuilder::new("x", Framing::Text)
            .poll_expecting("input", b"I\r\n".to_vec(), 1.0, "channel")
            .expect("poll")
            .build();
        assert!(matches!(r, Err(LinkError::Config(_))));
    }

    #[test]
    fn duplicates_fail_build() {
        let r = ProtocolBuilder::new("x", Framing::Text)
            .state_var("mute", VarType::Boolean)
            .read_only_var("mute", VarType::Boolean)
            .build();
        assert!(r.is_err());

        let r = ProtocolBuilder::new("x", Framing::Text)
            .command("a", |_| Ok(vec![1]))
            .expect("first")
            .command("a", |_| Ok(vec![2]));
        assert!(r.is_err());
    }

    #[test]
    fn zero_frequency_poll_fails_fast() {
        let r = ProtocolBuilder::new("x", Framing::Text).poll("mute", b"Z\r\n".to_vec(), 0.0);
        assert!(matches!(r, Err(LinkError::Config(_))));
    }
}
