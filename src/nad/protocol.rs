//! C338 command table, command encoding and response parsing

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{NadError, NadResult};

pub const CMD_MAIN: &str = "Main";
pub const CMD_BRIGHTNESS: &str = "Main.Brightness";
pub const CMD_BASS_EQ: &str = "Main.Bass";
pub const CMD_CONTROL_STANDBY: &str = "Main.ControlStandby";
pub const CMD_AUTO_STANDBY: &str = "Main.AutoStandby";
pub const CMD_VERSION: &str = "Main.Version";
pub const CMD_MUTE: &str = "Main.Mute";
pub const CMD_POWER: &str = "Main.Power";
pub const CMD_AUTO_SENSE: &str = "Main.AutoSense";
pub const CMD_SOURCE: &str = "Main.Source";
pub const CMD_VOLUME: &str = "Main.Volume";

pub const MSG_ON: &str = "On";
pub const MSG_OFF: &str = "Off";

/// Input sources of the C338, in device order
pub const C338_SOURCES: &[&str] = &[
    "Stream", "Wireless", "TV", "Phono", "Coax1", "Coax2", "Opt1", "Opt2",
];

/// Command operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `?` - query the current value
    Query,
    /// `+` - step up
    Increase,
    /// `-` - step down
    Decrease,
    /// `=` - set a value
    Set,
}

impl Operator {
    pub fn symbol(self) -> char {
        match self {
            Operator::Query => '?',
            Operator::Increase => '+',
            Operator::Decrease => '-',
            Operator::Set => '=',
        }
    }

    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '?' => Some(Operator::Query),
            '+' => Some(Operator::Increase),
            '-' => Some(Operator::Decrease),
            '=' => Some(Operator::Set),
            _ => None,
        }
    }
}

const ALL_OPERATORS: &[Operator] = &[
    Operator::Increase,
    Operator::Decrease,
    Operator::Set,
    Operator::Query,
];
const QUERY_ONLY: &[Operator] = &[Operator::Query];

/// Wire type of a command's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
}

/// Values a command accepts when set
#[derive(Debug, Clone, Copy)]
pub enum Allowed {
    /// No restriction (or nothing settable)
    Any,
    /// `Off`/`On`, mapped from booleans
    OnOff,
    /// Half-open integer range `[start, end)`
    IntRange(i64, i64),
    /// Half-open dB range `[start, end)`
    FloatRange(f64, f64),
    /// One of a fixed list of names
    Choices(&'static [&'static str]),
}

impl fmt::Display for Allowed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Allowed::Any => write!(f, "any value"),
            Allowed::OnOff => write!(f, "[{}, {}]", MSG_OFF, MSG_ON),
            Allowed::IntRange(start, end) => write!(f, "range({}, {})", start, end),
            Allowed::FloatRange(start, end) => write!(f, "range({}, {})", start, end),
            Allowed::Choices(choices) => write!(f, "{:?}", choices),
        }
    }
}

/// Static description of a C338 command
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub operators: &'static [Operator],
    pub allowed: Allowed,
    pub kind: Option<ValueKind>,
}

impl CommandSpec {
    pub fn supports(&self, operator: Operator) -> bool {
        self.operators.contains(&operator)
    }
}

pub const C338_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: CMD_MAIN,
        operators: QUERY_ONLY,
        allowed: Allowed::Any,
        kind: None,
    },
    CommandSpec {
        name: "Main.AnalogGain",
        operators: ALL_OPERATORS,
        allowed: Allowed::IntRange(0, 0),
        kind: Some(ValueKind::Int),
    },
    CommandSpec {
        name: CMD_BRIGHTNESS,
        operators: ALL_OPERATORS,
        allowed: Allowed::IntRange(0, 4),
        kind: Some(ValueKind::Int),
    },
    CommandSpec {
        name: CMD_MUTE,
        operators: ALL_OPERATORS,
        allowed: Allowed::OnOff,
        kind: Some(ValueKind::Bool),
    },
    CommandSpec {
        name: CMD_POWER,
        operators: ALL_OPERATORS,
        allowed: Allowed::OnOff,
        kind: Some(ValueKind::Bool),
    },
    CommandSpec {
        name: CMD_VOLUME,
        operators: ALL_OPERATORS,
        allowed: Allowed::FloatRange(-80.0, 0.0),
        kind: Some(ValueKind::Float),
    },
    CommandSpec {
        name: CMD_BASS_EQ,
        operators: ALL_OPERATORS,
        allowed: Allowed::OnOff,
        kind: Some(ValueKind::Bool),
    },
    CommandSpec {
        name: CMD_CONTROL_STANDBY,
        operators: ALL_OPERATORS,
        allowed: Allowed::OnOff,
        kind: Some(ValueKind::Bool),
    },
    CommandSpec {
        name: CMD_AUTO_STANDBY,
        operators: ALL_OPERATORS,
        allowed: Allowed::OnOff,
        kind: Some(ValueKind::Bool),
    },
    CommandSpec {
        name: CMD_AUTO_SENSE,
        operators: ALL_OPERATORS,
        allowed: Allowed::OnOff,
        kind: Some(ValueKind::Bool),
    },
    CommandSpec {
        name: CMD_SOURCE,
        operators: ALL_OPERATORS,
        allowed: Allowed::Choices(C338_SOURCES),
        kind: None,
    },
    CommandSpec {
        name: CMD_VERSION,
        operators: QUERY_ONLY,
        allowed: Allowed::Any,
        kind: Some(ValueKind::Float),
    },
    CommandSpec {
        name: "Main.Model",
        operators: QUERY_ONLY,
        allowed: Allowed::Choices(&["NADC338"]),
        kind: None,
    },
];

/// Look up a command by name
pub fn lookup(command: &str) -> Option<&'static CommandSpec> {
    C338_COMMANDS.iter().find(|spec| spec.name == command)
}

/// A typed value carried by a command or a state notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view (ints widen to f64)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { MSG_ON } else { MSG_OFF }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", format_float(*v)),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// Floats always carry a fractional part on the wire (`-40.0`, not `-40`)
fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

/// Build a command string for the amplifier
///
/// # Examples
/// ```
/// use nadtcp2::nad::{make_command, Operator};
///
/// assert_eq!(make_command("Main.Power", Operator::Set, Some(true.into())).unwrap(), "Main.Power=On");
/// assert_eq!(make_command("Main.Volume", Operator::Increase, None).unwrap(), "Main.Volume+");
/// ```
pub fn make_command(command: &str, operator: Operator, value: Option<Value>) -> NadResult<String> {
    let spec = lookup(command).ok_or_else(|| NadError::UnknownCommand(command.to_string()))?;

    if !spec.supports(operator) {
        return Err(NadError::InvalidOperator {
            command: command.to_string(),
            operator: operator.symbol(),
        });
    }

    let value = match (operator, value) {
        (Operator::Set, None) => return Err(NadError::MissingValue(command.to_string())),
        (Operator::Set, Some(value)) => Some(value),
        (op, Some(_)) => return Err(NadError::UnexpectedValue(op.symbol())),
        (_, None) => None,
    };

    let mut cmd = format!("{}{}", spec.name, operator.symbol());
    if let Some(value) = value {
        cmd.push_str(&encode_value(spec, &value)?);
    }
    Ok(cmd)
}

/// Validate and render a value for `spec`
fn encode_value(spec: &CommandSpec, value: &Value) -> NadResult<String> {
    let invalid = || NadError::InvalidValue {
        value: value.to_string(),
        allowed: spec.allowed.to_string(),
    };

    match spec.allowed {
        Allowed::OnOff => {
            let on = match value {
                Value::Bool(b) => *b,
                Value::Int(0) => false,
                Value::Int(1) => true,
                _ => return Err(invalid()),
            };
            Ok(if on { MSG_ON } else { MSG_OFF }.to_string())
        }
        Allowed::IntRange(start, end) => {
            let n = match value {
                Value::Int(i) => *i,
                Value::Float(f) if f.fract() == 0.0 => *f as i64,
                _ => return Err(invalid()),
            };
            if (start..end).contains(&n) {
                Ok(n.to_string())
            } else {
                Err(invalid())
            }
        }
        Allowed::FloatRange(start, end) => {
            let v = value.as_f64().ok_or_else(invalid)?;
            if v.is_finite() && v >= start && v < end {
                Ok(format_float(v))
            } else {
                Err(invalid())
            }
        }
        Allowed::Choices(choices) => match value {
            Value::Text(s) if choices.contains(&s.as_str()) => Ok(s.clone()),
            _ => Err(invalid()),
        },
        Allowed::Any => Ok(value.to_string()),
    }
}

/// Parse a single `<Command>=<value>` notification line
pub fn parse_part(line: &str) -> NadResult<(String, Value)> {
    let mut parts = line.split('=');
    let (key, raw) = match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(raw), None) => (key, raw),
        _ => return Err(NadError::MalformedResponse(line.to_string())),
    };

    let spec = lookup(key).ok_or_else(|| NadError::UnknownCommand(key.to_string()))?;

    let invalid = || NadError::InvalidValue {
        value: raw.to_string(),
        allowed: spec.allowed.to_string(),
    };

    let value = match spec.kind {
        Some(ValueKind::Bool) => match raw {
            MSG_OFF => Value::Bool(false),
            MSG_ON => Value::Bool(true),
            _ => return Err(invalid()),
        },
        Some(ValueKind::Int) => Value::Int(raw.trim().parse().map_err(|_| invalid())?),
        Some(ValueKind::Float) => Value::Float(raw.trim().parse().map_err(|_| invalid())?),
        None => Value::Text(raw.to_string()),
    };

    Ok((spec.name.to_string(), value))
}

/// Last known amplifier state, keyed by command name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceState(BTreeMap<String, Value>);

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single notification
    pub fn apply(&mut self, key: String, value: Value) -> bool {
        self.apply_batch([(key, value)])
    }

    /// Apply the reports of one read as a single update.
    ///
    /// A volume change while muted implicitly unmutes the amplifier, so the
    /// mute flag is cleared too. "Muted" means muted before this read: a
    /// full report listing `Main.Mute=On` ahead of `Main.Volume` keeps the
    /// amplifier muted. Returns whether anything was applied.
    pub fn apply_batch<I>(&mut self, parts: I) -> bool
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let was_muted = self.muted() == Some(true);

        let mut update = BTreeMap::new();
        for (key, value) in parts {
            let unmutes = was_muted && key == CMD_VOLUME;
            update.insert(key, value);
            if unmutes {
                update.insert(CMD_MUTE.to_string(), Value::Bool(false));
            }
        }

        if update.is_empty() {
            return false;
        }
        self.0.extend(update);
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn power(&self) -> Option<bool> {
        self.get(CMD_POWER).and_then(Value::as_bool)
    }

    /// Volume in dB
    pub fn volume(&self) -> Option<f64> {
        self.get(CMD_VOLUME).and_then(Value::as_f64)
    }

    pub fn muted(&self) -> Option<bool> {
        self.get(CMD_MUTE).and_then(Value::as_bool)
    }

    pub fn source(&self) -> Option<&str> {
        self.get(CMD_SOURCE).and_then(Value::as_str)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}
