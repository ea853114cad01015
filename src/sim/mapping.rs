//! mapping.rs
//! Firmware output to simulator channel mapping (`M01-01,S01-02,...`).

use std::{fmt, str::FromStr};

use crate::error::SitlError;
use crate::fc::{ActuatorSource, OutputKind};

/// Most entries a mapping string may carry.
pub const MAX_MAPPINGS: usize = 16;

/// One `<kind><output>-<channel>` entry, stored 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    pub kind: OutputKind,
    pub output: usize,
    pub sim_channel: usize,
}

impl FromStr for ChannelMap {
    type Err = SitlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SitlError::Config(format!("bad channel map entry '{}' (expected M01-01)", s));
        let mut chars = s.chars();
        let kind = match chars.next().map(|c| c.to_ascii_uppercase()) {
            Some('M') => OutputKind::Motor,
            Some('S') => OutputKind::Servo,
            _ => return Err(bad()),
        };
        let (output, channel) = chars.as_str().split_once('-').ok_or_else(bad)?;
        let output: usize = output.parse().map_err(|_| bad())?;
        let channel: usize = channel.parse().map_err(|_| bad())?;
        if output == 0 || channel == 0 {
            return Err(bad());
        }
        Ok(Self {
            kind,
            output: output - 1,
            sim_channel: channel - 1,
        })
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            OutputKind::Motor => 'M',
            OutputKind::Servo => 'S',
        };
        write!(f, "{}{:02}-{:02}", tag, self.output + 1, self.sim_channel + 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputMapping {
    entries: Vec<ChannelMap>,
}

impl FromStr for OutputMapping {
    type Err = SitlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entries = s
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(ChannelMap::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if entries.len() > MAX_MAPPINGS {
            return Err(SitlError::Config(format!(
                "{} channel map entries, at most {} allowed",
                entries.len(),
                MAX_MAPPINGS
            )));
        }
        Ok(Self { entries })
    }
}

impl OutputMapping {
    pub fn new(entries: Vec<ChannelMap>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ChannelMap] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject entries that address channels beyond what a backend carries.
    pub fn check_channels(&self, channels: usize) -> Result<(), SitlError> {
        match self.entries.iter().find(|e| e.sim_channel >= channels) {
            Some(e) => Err(SitlError::Config(format!(
                "channel map entry {} exceeds the simulator's {} channels",
                e, channels
            ))),
            None => Ok(()),
        }
    }

    /// Normalised values per simulator channel: motors 0..1, servos -1..1, unmapped 0.
    pub fn gather(&self, source: &dyn ActuatorSource, channels: usize) -> Vec<f32> {
        let mut values = vec![0.0; channels];
        for e in &self.entries {
            if let (Some(slot), Some(pwm)) = (values.get_mut(e.sim_channel), source.duty_us(e.kind, e.output)) {
                *slot = e.kind.normalize(pwm);
            }
        }
        values
    }

    /// Values per simulator channel on a 0..1 scale, unmapped channels at 0.5.
    pub fn gather_unit(&self, source: &dyn ActuatorSource, channels: usize) -> Vec<f32> {
        let mut values = vec![0.5; channels];
        for e in &self.entries {
            if let (Some(slot), Some(pwm)) = (values.get_mut(e.sim_channel), source.duty_us(e.kind, e.output)) {
                let v = e.kind.normalize(pwm);
                *slot = match e.kind {
                    OutputKind::Motor => v,
                    OutputKind::Servo => (v + 1.0) / 2.0,
                };
            }
        }
        values
    }
}

impl fmt::Display for OutputMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}
