//! Hierarchical topic names and wildcard subscription patterns.
//!
//! Topics are `/`-separated paths such as `sensors/imu/imu0`. Patterns use
//! the two usual wildcards:
//!
//! | Token | Matches |
//! |---|---|
//! | `+` | exactly one level |
//! | `#` | the remaining levels (zero or more); must be last |

use crate::bus::BusError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        let levels: Vec<&str> = pattern.split('/').collect();
        let mut segments = Vec::with_capacity(levels.len());
        for (i, level) in levels.iter().enumerate() {
            let segment = match *level {
                "+" => Segment::SingleLevel,
                "#" if i == levels.len() - 1 => Segment::MultiLevel,
                "" => return Err(BusError::InvalidPattern(pattern.to_string())),
                l if l.contains('#') || l.contains('+') => {
                    return Err(BusError::InvalidPattern(pattern.to_string()));
                }
                l => Segment::Literal(l.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `true` when `topic` is selected by this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');
        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(lit) => match levels.next() {
                    Some(level) if level == lit => {}
                    _ => return false,
                },
            }
        }
        levels.next().is_none()
    }
}

/// Rejects empty topics, empty levels and wildcard characters.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    let bad = topic.is_empty()
        || topic
            .split('/')
            .any(|level| level.is_empty() || level.contains('+') || level.contains('#'));
    if bad {
        Err(BusError::InvalidTopic(topic.to_string()))
    } else {
        Ok(())
    }
}
