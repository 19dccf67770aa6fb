//! Field paths: ordered segments addressing nested fields for diff, rebase
//! and history. Wildcard segments expand to all sequence elements.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// A mapping key.
    Key(String),
    /// A sequence index.
    Index(usize),
    /// All elements of a sequence.
    AllIndexes,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn from_segments(segments: Vec<PathSegment>) -> Path {
        Path { segments }
    }

    pub fn from_keys(keys: &[&str]) -> Path {
        Path {
            segments: keys.iter().map(|k| PathSegment::Key(k.to_string())).collect(),
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn push(&mut self, seg: PathSegment) {
        self.segments.push(seg);
    }

    pub fn join(&self, seg: PathSegment) -> Path {
        let mut segments = self.segments.clone();
        segments.push(seg);
        Path { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "(root)");
        }
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                PathSegment::Key(k) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", k)?;
                }
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
                PathSegment::AllIndexes => write!(f, "[*]")?,
            }
        }
        Ok(())
    }
}

// Config documents spell paths as sequences mixing keys, indexes and
// `{allIndexes: true}` markers, e.g. `[spec, ports, {allIndexes: true}, nodePort]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSegment {
    Index(usize),
    Key(String),
    Marker {
        #[serde(rename = "allIndexes")]
        all_indexes: bool,
    },
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Vec<RawSegment> = Vec::deserialize(deserializer)?;
        let mut segments = Vec::with_capacity(raw.len());
        for seg in raw {
            segments.push(match seg {
                RawSegment::Key(k) => PathSegment::Key(k),
                RawSegment::Index(i) => PathSegment::Index(i),
                RawSegment::Marker { all_indexes: true } => PathSegment::AllIndexes,
                RawSegment::Marker { all_indexes: false } => {
                    return Err(de::Error::custom("allIndexes marker must be true"))
                }
            });
        }
        Ok(Path { segments })
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.segments.len()))?;
        for seg in &self.segments {
            match seg {
                PathSegment::Key(k) => seq.serialize_element(k)?,
                PathSegment::Index(i) => seq.serialize_element(i)?,
                PathSegment::AllIndexes => {
                    seq.serialize_element(&serde_json::json!({"allIndexes": true}))?
                }
            }
        }
        seq.end()
    }
}

/// First value matched by the path, if any.
pub fn get_at<'a>(v: &'a Value, segs: &[PathSegment]) -> Option<&'a Value> {
    let (seg, rest) = match segs.split_first() {
        Some(pair) => pair,
        None => return Some(v),
    };
    match seg {
        PathSegment::Key(k) => get_at(v.get(k)?, rest),
        PathSegment::Index(i) => get_at(v.get(*i)?, rest),
        PathSegment::AllIndexes => v.as_array()?.iter().find_map(|e| get_at(e, rest)),
    }
}

/// All values matched by the path, expanding wildcards.
pub fn collect_at<'a>(v: &'a Value, segs: &[PathSegment]) -> Vec<&'a Value> {
    let mut out = Vec::new();
    collect_into(v, segs, &mut out);
    out
}

fn collect_into<'a>(v: &'a Value, segs: &[PathSegment], out: &mut Vec<&'a Value>) {
    let (seg, rest) = match segs.split_first() {
        Some(pair) => pair,
        None => {
            out.push(v);
            return;
        }
    };
    match seg {
        PathSegment::Key(k) => {
            if let Some(child) = v.get(k) {
                collect_into(child, rest, out);
            }
        }
        PathSegment::Index(i) => {
            if let Some(child) = v.get(*i) {
                collect_into(child, rest, out);
            }
        }
        PathSegment::AllIndexes => {
            if let Some(arr) = v.as_array() {
                for e in arr {
                    collect_into(e, rest, out);
                }
            }
        }
    }
}

fn coerce_object<'a>(
    v: &'a mut Value,
) -> Result<&'a mut serde_json::Map<String, Value>, String> {
    if v.is_null() {
        *v = Value::Object(serde_json::Map::new());
    }
    v.as_object_mut().ok_or_else(|| "path traverses a non-map value".to_string())
}

/// Writes `new` at the path, creating intermediate mappings for key segments.
/// A write through a wildcard applies to each sequence element; an absent
/// sequence yields zero matches and is not an error.
pub fn set_at(v: &mut Value, segs: &[PathSegment], new: &Value) -> Result<(), String> {
    let (seg, rest) = match segs.split_first() {
        Some(pair) => pair,
        None => {
            *v = new.clone();
            return Ok(());
        }
    };
    match seg {
        PathSegment::Key(k) => {
            let obj = coerce_object(v)?;
            let entry = obj.entry(k.clone()).or_insert(Value::Null);
            set_at(entry, rest, new)
        }
        PathSegment::Index(i) => {
            let is_null = v.is_null();
            match v.as_array_mut() {
                Some(arr) if *i < arr.len() => set_at(&mut arr[*i], rest, new),
                Some(arr) => Err(format!("index {} out of bounds (len {})", i, arr.len())),
                None if is_null => Err("indexing into an absent sequence".to_string()),
                None => Err("path traverses a non-sequence value".to_string()),
            }
        }
        PathSegment::AllIndexes => {
            let is_null = v.is_null();
            match v.as_array_mut() {
                Some(arr) => {
                    for e in arr.iter_mut() {
                        set_at(e, rest, new)?;
                    }
                    Ok(())
                }
                None if is_null => Ok(()),
                None => Err("path traverses a non-sequence value".to_string()),
            }
        }
    }
}

/// Removes the field at the path. Absent fields are not an error; traversing
/// through a scalar is.
pub fn remove_at(v: &mut Value, segs: &[PathSegment]) -> Result<bool, String> {
    let (seg, rest) = match segs.split_first() {
        Some(pair) => pair,
        None => return Err("cannot remove the document root".to_string()),
    };
    if v.is_null() {
        return Ok(false);
    }
    match seg {
        PathSegment::Key(k) => {
            let obj = match v.as_object_mut() {
                Some(obj) => obj,
                None => return Err("path traverses a non-map value".to_string()),
            };
            if rest.is_empty() {
                return Ok(obj.remove(k).is_some());
            }
            match obj.get_mut(k) {
                Some(child) => remove_at(child, rest),
                None => Ok(false),
            }
        }
        PathSegment::Index(i) => {
            let arr = match v.as_array_mut() {
                Some(arr) => arr,
                None => return Err("path traverses a non-sequence value".to_string()),
            };
            if *i >= arr.len() {
                return Ok(false);
            }
            if rest.is_empty() {
                arr.remove(*i);
                return Ok(true);
            }
            remove_at(&mut arr[*i], rest)
        }
        PathSegment::AllIndexes => {
            let arr = match v.as_array_mut() {
                Some(arr) => arr,
                None => return Err("path traverses a non-sequence value".to_string()),
            };
            if rest.is_empty() {
                let removed = !arr.is_empty();
                arr.clear();
                return Ok(removed);
            }
            let mut any = false;
            for e in arr.iter_mut() {
                any |= remove_at(e, rest)?;
            }
            Ok(any)
        }
    }
}

/// Copies the field at the path from `src` into `dst`. Wildcards expand over
/// indexes present on both sides. Returns whether anything was copied.
pub fn copy_at(dst: &mut Value, src: &Value, segs: &[PathSegment]) -> Result<bool, String> {
    let (seg, rest) = match segs.split_first() {
        Some(pair) => pair,
        None => {
            *dst = src.clone();
            return Ok(true);
        }
    };
    match seg {
        PathSegment::Key(k) => {
            let src_child = match src.get(k) {
                Some(c) => c,
                None => return Ok(false),
            };
            let obj = coerce_object(dst)?;
            let entry = obj.entry(k.clone()).or_insert(Value::Null);
            copy_at(entry, src_child, rest)
        }
        PathSegment::Index(i) => {
            let src_child = match src.get(*i) {
                Some(c) => c,
                None => return Ok(false),
            };
            let dst_is_null = dst.is_null();
            match dst.as_array_mut() {
                Some(arr) if *i < arr.len() => copy_at(&mut arr[*i], src_child, rest),
                Some(_) => Ok(false),
                None if dst_is_null => Ok(false),
                None => Err("path traverses a non-sequence value".to_string()),
            }
        }
        PathSegment::AllIndexes => {
            let src_arr = match src.as_array() {
                Some(a) => a,
                None => return Ok(false),
            };
            let dst_is_null = dst.is_null();
            match dst.as_array_mut() {
                Some(dst_arr) => {
                    let mut any = false;
                    let n = dst_arr.len().min(src_arr.len());
                    for i in 0..n {
                        any |= copy_at(&mut dst_arr[i], &src_arr[i], rest)?;
                    }
                    Ok(any)
                }
                None if dst_is_null => Ok(false),
                None => Err("path traverses a non-sequence value".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_formats() {
        let mut p = Path::from_keys(&["spec", "ports"]);
        p.push(PathSegment::AllIndexes);
        p.push(PathSegment::Key("nodePort".into()));
        assert_eq!(p.to_string(), "spec.ports[*].nodePort");
        assert_eq!(Path::default().to_string(), "(root)");
    }

    #[test]
    fn deserializes_config_syntax() {
        let p: Path = serde_yaml::from_str("[spec, ports, {allIndexes: true}, nodePort]").unwrap();
        assert_eq!(
            p.segments(),
            &[
                PathSegment::Key("spec".into()),
                PathSegment::Key("ports".into()),
                PathSegment::AllIndexes,
                PathSegment::Key("nodePort".into()),
            ]
        );
        let p: Path = serde_yaml::from_str("[spec, containers, 0, image]").unwrap();
        assert_eq!(p.segments()[2], PathSegment::Index(0));
    }

    #[test]
    fn get_through_wildcard_finds_first_match() {
        let v = json!({"spec": {"ports": [{"port": 1}, {"port": 2, "nodePort": 30080}]}});
        let p: Path = serde_yaml::from_str("[spec, ports, {allIndexes: true}, nodePort]").unwrap();
        assert_eq!(get_at(&v, p.segments()), Some(&json!(30080)));
        assert_eq!(collect_at(&v, p.segments()).len(), 1);
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut v = json!({});
        set_at(
            &mut v,
            Path::from_keys(&["metadata", "labels", "app"]).segments(),
            &json!("x"),
        )
        .unwrap();
        assert_eq!(v, json!({"metadata": {"labels": {"app": "x"}}}));
    }

    #[test]
    fn set_wildcard_without_sequence_is_noop() {
        let mut v = json!({"spec": {}});
        let p: Path = serde_yaml::from_str("[spec, ports, {allIndexes: true}, protocol]").unwrap();
        set_at(&mut v, p.segments(), &json!("TCP")).unwrap();
        assert_eq!(v, json!({"spec": {"ports": {}}}));
    }

    #[test]
    fn remove_absent_is_false_scalar_is_error() {
        let mut v = json!({"metadata": {"name": "x"}});
        assert!(!remove_at(&mut v, Path::from_keys(&["metadata", "labels", "a"]).segments()).unwrap());
        assert!(remove_at(&mut v, Path::from_keys(&["metadata", "name", "a"]).segments()).is_err());
    }

    #[test]
    fn remove_wildcard_clears_elements() {
        let mut v = json!({"a": [{"x": 1}, {"x": 2}]});
        let p: Path = serde_yaml::from_str("[a, {allIndexes: true}, x]").unwrap();
        assert!(remove_at(&mut v, p.segments()).unwrap());
        assert_eq!(v, json!({"a": [{}, {}]}));
    }

    #[test]
    fn copy_wildcard_pairs_indexes() {
        let src = json!({"spec": {"ports": [{"nodePort": 31000}, {"nodePort": 31001}]}});
        let mut dst = json!({"spec": {"ports": [{"port": 80}]}});
        let p: Path = serde_yaml::from_str("[spec, ports, {allIndexes: true}, nodePort]").unwrap();
        assert!(copy_at(&mut dst, &src, p.segments()).unwrap());
        assert_eq!(dst, json!({"spec": {"ports": [{"port": 80, "nodePort": 31000}]}}));
    }

    #[test]
    fn copy_absent_source_is_false() {
        let src = json!({"spec": {}});
        let mut dst = json!({"spec": {"x": 1}});
        assert!(!copy_at(&mut dst, &src, Path::from_keys(&["spec", "clusterIP"]).segments()).unwrap());
        assert_eq!(dst, json!({"spec": {"x": 1}}));
    }
}
