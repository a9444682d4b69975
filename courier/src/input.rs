use anyhow::{Result, bail};

/// Namespace of metrics whose name does not specify one.
const DEFAULT_NAMESPACE: &str = "custom";

/// A metric value parsed from an input line.
#[derive(Debug, PartialEq)]
pub struct MetricLine<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub value: &'a str,
    /// Dimension names and values, sorted by name.
    pub dimensions: Vec<(&'a str, &'a str)>,
}

impl MetricLine<'_> {
    pub fn dimension_names(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(|(name, _)| *name)
    }

    pub fn dimension_values(&self) -> Vec<&str> {
        self.dimensions.iter().map(|(_, value)| *value).collect()
    }
}

/// A line read from standard input.
#[derive(Debug, PartialEq)]
pub enum InputLine<'a> {
    Empty,
    Trace(&'a str),
    Metric(MetricLine<'a>),
}

impl<'a> InputLine<'a> {
    pub fn parse(line: &'a str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(Self::Empty);
        }

        if let Some(message) = line.strip_prefix("trace ") {
            return Ok(Self::Trace(message.trim()));
        }

        let mut parts = line.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            bail!("expected a metric name and a value");
        };

        let (namespace, name) = name.split_once('/').unwrap_or((DEFAULT_NAMESPACE, name));
        if namespace.is_empty() || name.is_empty() {
            bail!("empty metric namespace or name");
        }

        let mut dimensions = Vec::new();
        for part in parts {
            let Some((key, value)) = part.split_once('=') else {
                bail!("expected `dimension=value`, got `{part}`");
            };
            if key.is_empty() {
                bail!("empty dimension name in `{part}`");
            }
            if dimensions.iter().any(|(existing, _)| *existing == key) {
                bail!("duplicate dimension `{key}`");
            }
            dimensions.push((key, value));
        }
        dimensions.sort_unstable_by_key(|(key, _)| *key);

        Ok(Self::Metric(MetricLine {
            namespace,
            name,
            value,
            dimensions,
        }))
    }
}
