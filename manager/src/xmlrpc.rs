// File: manager/src/xmlrpc.rs
//! A minimal XML-RPC client sufficient for the process supervisor's API
//! (`supervisor.getProcessInfo`, `supervisor.startProcess`,
//! `supervisor.stopProcess`). The supervisor's own RPC server is an
//! external collaborator (spec §6); this module only needs to speak the
//! small subset of XML-RPC those three methods use.

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::HashMap;
use std::fmt::Write as _;

#[derive(Debug, Clone)]
pub enum XmlRpcValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Struct(HashMap<String, XmlRpcValue>),
    Array(Vec<XmlRpcValue>),
}

impl XmlRpcValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            XmlRpcValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            XmlRpcValue::Bool(v) => Some(*v),
            XmlRpcValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&HashMap<String, XmlRpcValue>> {
        match self {
            XmlRpcValue::Struct(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Param {
    Str(String),
}

/// Builds a `methodCall` request body for `method_name(params...)`.
pub fn build_request(method_name: &str, params: &[Param]) -> String {
    let mut body = String::new();
    write!(body, "<?xml version=\"1.0\"?>\n<methodCall><methodName>{}</methodName><params>", method_name).unwrap();
    for p in params {
        match p {
            Param::Str(s) => {
                write!(body, "<param><value><string>{}</string></value></param>", escape(s)).unwrap();
            }
        }
    }
    body.push_str("</params></methodCall>");
    body
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Parses a `methodResponse` body, returning the single top-level value
/// (a fault is surfaced as an error).
pub fn parse_response(xml: &str) -> Result<XmlRpcValue> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<StackFrame> = Vec::new();
    let mut fault = false;
    let mut result: Option<XmlRpcValue> = None;

    loop {
        match reader.read_event().context("reading xml-rpc response")? {
            Event::Eof => break,
            Event::Start(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).to_string();
                match name.as_str() {
                    "fault" => fault = true,
                    "struct" => stack.push(StackFrame::Struct(HashMap::new(), None)),
                    "array" => stack.push(StackFrame::Array(Vec::new())),
                    "member" => stack.push(StackFrame::Member(None, None)),
                    "name" => {}
                    "value" | "int" | "i4" | "boolean" | "string" | "methodResponse" | "params" | "param" => {}
                    other => {
                        stack.push(StackFrame::Scalar(other.to_string(), String::new()));
                    }
                }
            }
            Event::Text(text) => {
                if let Some(StackFrame::Scalar(_, buf)) = stack.last_mut() {
                    buf.push_str(&text.unescape().context("unescaping xml text")?);
                } else if let Some(StackFrame::Member(ref mut name, _)) = stack.last_mut() {
                    if name.is_none() {
                        *name = Some(text.unescape().context("unescaping member name")?.to_string());
                    }
                }
            }
            Event::End(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).to_string();
                let value = match name.as_str() {
                    "int" | "i4" => {
                        if let Some(StackFrame::Scalar(_, buf)) = stack.pop() {
                            Some(XmlRpcValue::Int(buf.trim().parse().unwrap_or_default()))
                        } else {
                            None
                        }
                    }
                    "boolean" => {
                        if let Some(StackFrame::Scalar(_, buf)) = stack.pop() {
                            Some(XmlRpcValue::Bool(buf.trim() == "1"))
                        } else {
                            None
                        }
                    }
                    "string" => {
                        if let Some(StackFrame::Scalar(_, buf)) = stack.pop() {
                            Some(XmlRpcValue::Str(buf))
                        } else {
                            None
                        }
                    }
                    "struct" => {
                        if let Some(StackFrame::Struct(map, _)) = stack.pop() {
                            Some(XmlRpcValue::Struct(map))
                        } else {
                            None
                        }
                    }
                    "array" => {
                        if let Some(StackFrame::Array(items)) = stack.pop() {
                            Some(XmlRpcValue::Array(items))
                        } else {
                            None
                        }
                    }
                    "member" => {
                        if let Some(StackFrame::Member(Some(member_name), Some(value))) = stack.pop() {
                            if let Some(StackFrame::Struct(map, _)) = stack.last_mut() {
                                map.insert(member_name, value);
                            }
                        }
                        None
                    }
                    "value" => None,
                    "param" | "params" | "methodResponse" => None,
                    _ => None,
                };

                if let Some(value) = value {
                    match stack.last_mut() {
                        Some(StackFrame::Member(_, slot)) => *slot = Some(value),
                        Some(StackFrame::Array(items)) => items.push(value),
                        _ => result = Some(value),
                    }
                }
            }
            _ => {}
        }
    }

    if fault {
        bail!("xml-rpc fault response: {}", xml);
    }

    result.ok_or_else(|| anyhow!("xml-rpc response contained no value"))
}

enum StackFrame {
    Scalar(String, String),
    Struct(HashMap<String, XmlRpcValue>, Option<()>),
    Array(Vec<XmlRpcValue>),
    Member(Option<String>, Option<XmlRpcValue>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_process_info_struct() {
        let xml = r#"<?xml version="1.0"?>
<methodResponse><params><param><value><struct>
<member><name>state</name><value><int>20</int></value></member>
<member><name>start</name><value><int>1000</int></value></member>
<member><name>now</name><value><int>1042</int></value></member>
</struct></value></param></params></methodResponse>"#;
        let value = parse_response(xml).unwrap();
        let s = value.as_struct().unwrap();
        assert_eq!(s.get("state").unwrap().as_int(), Some(20));
        assert_eq!(s.get("start").unwrap().as_int(), Some(1000));
        assert_eq!(s.get("now").unwrap().as_int(), Some(1042));
    }

    #[test]
    fn parses_boolean_result() {
        let xml = r#"<?xml version="1.0"?>
<methodResponse><params><param><value><boolean>1</boolean></value></param></params></methodResponse>"#;
        let value = parse_response(xml).unwrap();
        assert_eq!(value.as_bool(), Some(true));
    }

    #[test]
    fn build_request_escapes_params() {
        let body = build_request("supervisor.startProcess", &[Param::Str("a&b".to_string())]);
        assert!(body.contains("a&amp;b"));
        assert!(body.contains("<methodName>supervisor.startProcess</methodName>"));
    }
}
