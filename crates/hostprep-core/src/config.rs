//! Property-list config artifacts (`hbase-site.xml` style).
//!
//! The rendered document is a function of the property set alone: same
//! entries in the same order always produce the same bytes.

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, ProvisionResult};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// A single `{name, value}` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

/// Ordered property entries, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Property>", into = "Vec<Property>")]
pub struct PropertySet {
    entries: Vec<Property>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`. A replaced entry keeps its original position.
    /// Returns the previous value, if any.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|p| p.name == name) {
            Some(existing) => Some(std::mem::replace(&mut existing.value, value)),
            None => {
                self.entries.push(Property { name, value });
                None
            }
        }
    }

    /// Builder form of [`PropertySet::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.entries.iter()
    }

    /// Render as a `<configuration>` XML document.
    pub fn render(&self) -> ProvisionResult<String> {
        render_configuration(self)
    }
}

impl TryFrom<Vec<Property>> for PropertySet {
    type Error = String;

    fn try_from(entries: Vec<Property>) -> Result<Self, Self::Error> {
        let mut set = PropertySet::new();
        for property in entries {
            if set.get(&property.name).is_some() {
                return Err(format!("duplicate property: {}", property.name));
            }
            set.entries.push(property);
        }
        Ok(set)
    }
}

impl From<PropertySet> for Vec<Property> {
    fn from(set: PropertySet) -> Self {
        set.entries
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertySet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = PropertySet::new();
        for (name, value) in iter {
            set.set(name, value);
        }
        set
    }
}

#[derive(Serialize)]
#[serde(rename = "configuration")]
struct ConfigurationDoc<'a> {
    property: &'a [Property],
}

/// Render `properties` as an XML `<configuration>` document with a trailing
/// newline.
pub fn render_configuration(properties: &PropertySet) -> ProvisionResult<String> {
    let doc = ConfigurationDoc {
        property: &properties.entries,
    };

    let mut body = String::new();
    let mut serializer = quick_xml::se::Serializer::new(&mut body);
    serializer.indent(' ', 2);
    doc.serialize(serializer)
        .map_err(|e| ProvisionError::ConfigWrite {
            path: "<render>".to_string(),
            reason: e.to_string(),
        })?;

    Ok(format!("{}\n{}\n", XML_DECLARATION, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PropertySet {
        PropertySet::new()
            .with("hbase.rootdir", "file:///var/lib/hbase")
            .with("hbase.zookeeper.property.dataDir", "/var/lib/zookeeper")
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut props = sample();
        let old = props.set("hbase.rootdir", "hdfs://nn:8020/hbase");
        assert_eq!(old.as_deref(), Some("file:///var/lib/hbase"));
        assert_eq!(props.len(), 2);

        let names: Vec<&str> = props.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["hbase.rootdir", "hbase.zookeeper.property.dataDir"]);
        assert_eq!(props.get("hbase.rootdir"), Some("hdfs://nn:8020/hbase"));
    }

    #[test]
    fn test_from_iter_dedups() {
        let props: PropertySet = vec![("a", "1"), ("b", "2"), ("a", "3")]
            .into_iter()
            .collect();
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("a"), Some("3"));
    }

    #[test]
    fn test_duplicate_names_rejected_on_deserialize() {
        let json = r#"[{"name":"a","value":"1"},{"name":"a","value":"2"}]"#;
        let err = serde_json::from_str::<PropertySet>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate property: a"));
    }

    #[test]
    fn test_render_contains_exactly_the_properties() {
        let xml = sample().render().unwrap();
        assert!(xml.starts_with(XML_DECLARATION));
        assert!(xml.ends_with('\n'));
        assert!(xml.contains("<configuration>"));
        assert!(xml.contains("</configuration>"));
        assert_eq!(xml.matches("<property>").count(), 2);
        assert!(xml.contains("<name>hbase.rootdir</name>"));
        assert!(xml.contains("<value>file:///var/lib/hbase</value>"));
        assert!(xml.contains("<name>hbase.zookeeper.property.dataDir</name>"));
    }

    #[test]
    fn test_render_preserves_order() {
        let xml = sample().render().unwrap();
        let first = xml.find("hbase.rootdir").unwrap();
        let second = xml.find("hbase.zookeeper.property.dataDir").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = sample().render().unwrap();
        let b = sample().render().unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_render_escapes_values() {
        let props = PropertySet::new().with("jdbc.url", "a<b&c");
        let xml = props.render().unwrap();
        assert!(xml.contains("a&lt;b&amp;c"));
        assert!(!xml.contains("a<b&c"));
    }
}
