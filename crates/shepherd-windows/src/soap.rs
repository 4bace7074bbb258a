//! Lenient SOAP/XML helpers.
//!
//! Enrollment clients vary in namespace prefixes, so requests are matched on
//! local element names only. Responses are rendered from templates with the
//! canonical prefixes.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;

/// Inner text of the first element whose local name matches.
pub fn extract_text(xml: &str, local: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) if e.local_name().as_ref() == local.as_bytes() => {
                let end = e.to_end().into_owned();
                let text = reader.read_text(end.name()).ok()?;
                return Some(text.trim().to_string());
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// A `wsse:BinarySecurityToken` with its `ValueType` attribute.
#[derive(Debug, Clone)]
pub struct BinaryToken {
    pub value_type: String,
    pub text: String,
}

/// Every BinarySecurityToken in the document, in order.
pub fn binary_security_tokens(xml: &str) -> Vec<BinaryToken> {
    let mut reader = Reader::from_str(xml);
    let mut tokens = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"BinarySecurityToken" => {
                let value_type = e
                    .try_get_attribute("ValueType")
                    .ok()
                    .flatten()
                    .map(|a| String::from_utf8_lossy(&a.value).to_string())
                    .unwrap_or_default();
                let end = e.to_end().into_owned();
                let Ok(text) = reader.read_text(end.name()) else {
                    break;
                };
                tokens.push(BinaryToken {
                    value_type,
                    // Clients wrap the base64 across lines.
                    text: text.split_whitespace().collect::<String>(),
                });
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    tokens
}

/// `AdditionalContext` items as a name → value map.
pub fn context_items(xml: &str) -> HashMap<String, String> {
    let mut reader = Reader::from_str(xml);
    let mut items = HashMap::new();
    let mut pending_name: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"ContextItem" => {
                pending_name = e
                    .try_get_attribute("Name")
                    .ok()
                    .flatten()
                    .map(|a| String::from_utf8_lossy(&a.value).to_string());
            }
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"Value" => {
                let end = e.to_end().into_owned();
                let Ok(text) = reader.read_text(end.name()) else {
                    break;
                };
                if let Some(name) = pending_name.take() {
                    items.insert(name, text.trim().to_string());
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    items
}

/// Minimal XML escaping for text rendered into response templates.
pub fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render a SOAP 1.2 fault.
pub fn soap_fault(code: &str, reason: &str, relates_to: Option<&str>) -> String {
    let relates = relates_to
        .map(|r| format!("<a:RelatesTo>{}</a:RelatesTo>", escape(r)))
        .unwrap_or_default();
    format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing">
  <s:Header>
    <a:Action s:mustUnderstand="1">http://schemas.xmlsoap.org/ws/2004/08/addressing/fault</a:Action>
    {relates}
  </s:Header>
  <s:Body>
    <s:Fault>
      <s:Code><s:Value>{code}</s:Value></s:Code>
      <s:Reason><s:Text xml:lang="en-us">{reason}</s:Text></s:Reason>
    </s:Fault>
  </s:Body>
</s:Envelope>"#,
        relates = relates,
        code = escape(code),
        reason = escape(reason),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
  xmlns:a="http://www.w3.org/2005/08/addressing">
  <s:Header><a:MessageID>urn:uuid:abc-123</a:MessageID></s:Header>
  <s:Body>
    <Discover><request>
      <EmailAddress>user@example.com</EmailAddress>
    </request></Discover>
  </s:Body>
</s:Envelope>"#;

    #[test]
    fn extracts_text_by_local_name() {
        assert_eq!(
            extract_text(SAMPLE, "MessageID").as_deref(),
            Some("urn:uuid:abc-123")
        );
        assert_eq!(
            extract_text(SAMPLE, "EmailAddress").as_deref(),
            Some("user@example.com")
        );
        assert!(extract_text(SAMPLE, "NoSuchElement").is_none());
    }

    #[test]
    fn collects_binary_security_tokens_with_value_type() {
        let xml = r#"<x>
          <wsse:BinarySecurityToken ValueType="http://schemas.microsoft.com/5.0.0.0/ConfigurationManager/Enrollment/DeviceEnrollmentUserToken">
            QUJD
            REVG
          </wsse:BinarySecurityToken>
        </x>"#;
        let tokens = binary_security_tokens(xml);
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].value_type.contains("DeviceEnrollmentUserToken"));
        assert_eq!(tokens[0].text, "QUJDREVG");
    }

    #[test]
    fn collects_context_items() {
        let xml = r#"<ac:AdditionalContext xmlns:ac="http://schemas.xmlsoap.org/ws/2006/12/authorization">
          <ac:ContextItem Name="DeviceType"><ac:Value>CIMClient_Windows</ac:Value></ac:ContextItem>
          <ac:ContextItem Name="OSVersion"><ac:Value>10.0.19045.2965</ac:Value></ac:ContextItem>
        </ac:AdditionalContext>"#;
        let items = context_items(xml);
        assert_eq!(items.get("DeviceType").map(String::as_str), Some("CIMClient_Windows"));
        assert_eq!(items.get("OSVersion").map(String::as_str), Some("10.0.19045.2965"));
    }

    #[test]
    fn fault_renders_code_and_reason() {
        let fault = soap_fault("s:Sender", "host data cannot be found", None);
        assert!(fault.contains("<s:Value>s:Sender</s:Value>"));
        assert!(fault.contains("host data cannot be found"));
    }
}
