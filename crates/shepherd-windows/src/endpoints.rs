//! The MS-MDE2 Discovery, Policy, and Enrollment endpoints.

use base64::Engine as _;
use chrono::Utc;
use shepherd_domain::{Platform, WindowsEnrollType, WindowsEnrollment};
use shepherd_pki::CertificateAuthority;
use shepherd_store::{Activity, Store};
use tracing::info;

use crate::error::WindowsError;
use crate::soap::{binary_security_tokens, context_items, escape, extract_text, BinaryToken};

/// ValueType of the agent-updater node-key token (programmatic enrollment).
pub const TOKEN_TYPE_DEVICE_ENROLL: &str =
    "http://schemas.microsoft.com/5.0.0.0/ConfigurationManager/Enrollment/DeviceEnrollmentUserToken";

/// ValueType of an Azure-AD-issued JWT (automatic enrollment).
pub const TOKEN_TYPE_AZURE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";

/// ValueType of the PKCS#10 request inside the Enrollment body.
pub const TOKEN_TYPE_PKCS10: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#PKCS10";

/// Accept standard and raw (unpadded) base64.
pub fn decode_base64_any(s: &str) -> Result<Vec<u8>, WindowsError> {
    base64::engine::general_purpose::STANDARD
        .decode(s.as_bytes())
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(s.as_bytes()))
        .map_err(|e| WindowsError::Xml(format!("invalid base64: {}", e)))
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Handle `POST /EnrollmentServer/Discovery.svc`.
///
/// An empty `EmailAddress` is the device-initiated case: the response then
/// carries no `AuthenticationServiceUrl`, signalling on-prem auth.
pub fn process_discovery(server_url: &str, body: &str) -> Result<String, WindowsError> {
    let message_id = extract_text(body, "MessageID")
        .ok_or_else(|| WindowsError::sender_fault("invalid SOAP header: MessageID is missing"))?;
    let email = extract_text(body, "EmailAddress").unwrap_or_default();

    let auth_section = if email.is_empty() {
        "<AuthPolicy>OnPremise</AuthPolicy>".to_string()
    } else {
        format!(
            "<AuthPolicy>Federated</AuthPolicy>\n        <AuthenticationServiceUrl>{}/EnrollmentServer/Authenticate.svc</AuthenticationServiceUrl>",
            escape(server_url)
        )
    };

    Ok(format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing">
  <s:Header>
    <a:Action s:mustUnderstand="1">http://schemas.microsoft.com/windows/management/2012/01/enrollment/IDiscoveryService/DiscoverResponse</a:Action>
    <a:RelatesTo>{message_id}</a:RelatesTo>
  </s:Header>
  <s:Body>
    <DiscoverResponse xmlns="http://schemas.microsoft.com/windows/management/2012/01/enrollment">
      <DiscoverResult>
        {auth_section}
        <EnrollmentVersion>4.0</EnrollmentVersion>
        <EnrollmentPolicyServiceUrl>{server_url}/EnrollmentServer/Policy.svc</EnrollmentPolicyServiceUrl>
        <EnrollmentServiceUrl>{server_url}/EnrollmentServer/Enrollment.svc</EnrollmentServiceUrl>
      </DiscoverResult>
    </DiscoverResponse>
  </s:Body>
</s:Envelope>"#,
        message_id = escape(&message_id),
        auth_section = auth_section,
        server_url = escape(server_url),
    ))
}

// ── Policy ────────────────────────────────────────────────────────────────────

async fn validate_auth_token(
    store: &dyn Store,
    tokens: &[BinaryToken],
) -> Result<(WindowsEnrollType, Option<String>), WindowsError> {
    let auth = tokens
        .iter()
        .find(|t| t.value_type == TOKEN_TYPE_DEVICE_ENROLL || t.value_type == TOKEN_TYPE_AZURE_JWT)
        .ok_or_else(|| {
            WindowsError::sender_fault("invalid body: BinarySecurityToken is not present")
        })?;

    if auth.value_type == TOKEN_TYPE_AZURE_JWT {
        if auth.text.is_empty() {
            return Err(WindowsError::sender_fault("invalid body: empty security token"));
        }
        return Ok((WindowsEnrollType::Automatic, None));
    }

    let node_key_bytes = decode_base64_any(&auth.text)?;
    let node_key = String::from_utf8(node_key_bytes)
        .map_err(|_| WindowsError::sender_fault("invalid body: malformed security token"))?;
    let host = store
        .get_host_by_orbit_node_key(&node_key)
        .await?
        .ok_or_else(|| WindowsError::sender_fault("host data cannot be found"))?;
    if host.platform != Platform::Windows {
        return Err(WindowsError::sender_fault(
            "host is not elegible for Windows MDM enrollment",
        ));
    }
    Ok((WindowsEnrollType::Programmatic, Some(host.uuid)))
}

/// Handle `POST /EnrollmentServer/Policy.svc`.
pub async fn process_policy(store: &dyn Store, body: &str) -> Result<String, WindowsError> {
    let message_id = extract_text(body, "MessageID").unwrap_or_default();
    let tokens = binary_security_tokens(body);
    validate_auth_token(store, &tokens).await?;

    Ok(format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing">
  <s:Header>
    <a:Action s:mustUnderstand="1">http://schemas.microsoft.com/windows/pki/2009/01/enrollmentpolicy/IPolicy/GetPoliciesResponse</a:Action>
    <a:RelatesTo>{message_id}</a:RelatesTo>
  </s:Header>
  <s:Body>
    <GetPoliciesResponse xmlns="http://schemas.microsoft.com/windows/pki/2009/01/enrollmentpolicy">
      <response>
        <policies>
          <policy>
            <policyOIDReference>0</policyOIDReference>
            <cAs xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
            <attributes>
              <policySchema>3</policySchema>
              <privateKeyAttributes>
                <minimalKeyLength>2048</minimalKeyLength>
                <keySpec xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
                <algorithmOIDReference xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              </privateKeyAttributes>
              <supersededPolicies xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              <privateKeyFlags xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              <subjectNameFlags xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              <enrollmentFlags xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              <generalFlags xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              <hashAlgorithmOIDReference>0</hashAlgorithmOIDReference>
              <rARequirements xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              <keyArchivalAttributes xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              <extensions xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
              <validityPeriodSeconds>1209600</validityPeriodSeconds>
              <renewalPeriodSeconds>172800</renewalPeriodSeconds>
            </attributes>
          </policy>
        </policies>
      </response>
      <oIDs>
        <oID>
          <value>1.3.14.3.2.29</value>
          <group>1</group>
          <oIDReferenceID>0</oIDReferenceID>
          <defaultName>szOID_OIWSEC_sha1RSASign</defaultName>
        </oID>
      </oIDs>
    </GetPoliciesResponse>
  </s:Body>
</s:Envelope>"#,
        message_id = escape(&message_id),
    ))
}

// ── Enrollment ────────────────────────────────────────────────────────────────

/// Handle `POST /EnrollmentServer/Enrollment.svc`: issue the device cert and
/// persist the enrollment.
pub async fn process_enrollment(
    store: &dyn Store,
    ca: &CertificateAuthority,
    server_url: &str,
    body: &str,
) -> Result<String, WindowsError> {
    let message_id = extract_text(body, "MessageID").unwrap_or_default();
    let tokens = binary_security_tokens(body);

    let (enroll_type, host_uuid) = validate_auth_token(store, &tokens).await?;
    let csr_token = tokens
        .iter()
        .find(|t| t.value_type == TOKEN_TYPE_PKCS10 || t.value_type.ends_with("#PKCS10"))
        .ok_or_else(|| {
            WindowsError::sender_fault("invalid body: PKCS10 BinarySecurityToken is not present")
        })?;
    let csr_der = decode_base64_any(&csr_token.text)?;

    let ctx = context_items(body);
    let device_type = ctx
        .get("DeviceType")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            WindowsError::sender_fault("invalid AdditionalContext: DeviceType is missing")
        })?;
    if device_type != "CIMClient_Windows" {
        return Err(WindowsError::sender_fault(format!(
            "invalid AdditionalContext: unsupported DeviceType {:?}",
            device_type
        )));
    }
    let device_id = ctx
        .get("DeviceID")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            WindowsError::sender_fault("invalid AdditionalContext: DeviceID is missing")
        })?;

    let issued = ca.issue_from_csr(&csr_der)?;
    let now = Utc::now();
    let enrollment = WindowsEnrollment {
        mdm_device_id: device_id.clone(),
        hardware_id: ctx.get("HWDevID").cloned().unwrap_or_else(|| device_id.clone()),
        device_name: ctx.get("DeviceName").cloned().unwrap_or_default(),
        enroll_type,
        os_version: ctx.get("OSVersion").cloned().unwrap_or_default(),
        not_in_oobe: ctx.get("NotInOobe").map(|v| v == "true").unwrap_or(false),
        host_uuid: host_uuid.clone(),
        cert_fingerprint: Some(issued.fingerprint.clone()),
        created_at: now,
    };
    store.upsert_windows_enrollment(&enrollment).await?;
    store
        .append_activity(&Activity::MdmEnrolled {
            at: now,
            host_uuid: host_uuid.unwrap_or_else(|| device_id.clone()),
            platform: Platform::Windows,
        })
        .await?;
    info!(mdm_device_id = %device_id, enroll_type = %enrollment.enroll_type, "windows enrollment issued");

    let b64 = base64::engine::general_purpose::STANDARD;
    let provisioning = format!(
        r#"<wap-provisioningdoc version="1.1">
  <characteristic type="CertificateStore">
    <characteristic type="Root">
      <characteristic type="System">
        <characteristic type="{ca_fingerprint}">
          <parm name="EncodedCertificate" value="{ca_cert}"/>
        </characteristic>
      </characteristic>
    </characteristic>
    <characteristic type="My">
      <characteristic type="User">
        <characteristic type="{cert_fingerprint}">
          <parm name="EncodedCertificate" value="{cert}"/>
        </characteristic>
        <characteristic type="PrivateKeyContainer"/>
      </characteristic>
    </characteristic>
  </characteristic>
  <characteristic type="APPLICATION">
    <parm name="APPID" value="w7"/>
    <parm name="PROVIDER-ID" value="Shepherd"/>
    <parm name="NAME" value="Shepherd MDM"/>
    <parm name="ADDR" value="{server_url}/ManagementServer/Manage.svc"/>
    <parm name="ROLE" value="4294967295"/>
    <parm name="SSLCLIENTCERTSEARCHCRITERIA" value="Subject=CN%3dShepherd%20identity&amp;Stores=MY%5CUser"/>
    <characteristic type="APPAUTH">
      <parm name="AAUTHLEVEL" value="CLIENT"/>
      <parm name="AAUTHTYPE" value="DIGEST"/>
      <parm name="AAUTHSECRET" value="dummy"/>
      <parm name="AAUTHDATA" value="nonce"/>
    </characteristic>
  </characteristic>
</wap-provisioningdoc>"#,
        ca_fingerprint = shepherd_pki::ca::fingerprint(ca.cert_der()),
        ca_cert = b64.encode(ca.cert_der()),
        cert_fingerprint = issued.fingerprint,
        cert = b64.encode(&issued.cert_der),
        server_url = escape(server_url),
    );

    Ok(format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing">
  <s:Header>
    <a:Action s:mustUnderstand="1">http://schemas.microsoft.com/windows/pki/2009/01/enrollment/RSTRC/wstep</a:Action>
    <a:RelatesTo>{message_id}</a:RelatesTo>
  </s:Header>
  <s:Body>
    <RequestSecurityTokenResponseCollection xmlns="http://docs.oasis-open.org/ws-sx/ws-trust/200512">
      <RequestSecurityTokenResponse>
        <TokenType>http://schemas.microsoft.com/5.0.0.0/ConfigurationManager/Enrollment/DeviceEnrollmentToken</TokenType>
        <RequestedSecurityToken>
          <BinarySecurityToken xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"
            ValueType="http://schemas.microsoft.com/5.0.0.0/ConfigurationManager/Enrollment/DeviceEnrollmentProvisionDoc"
            EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd#base64binary">{provisioning_b64}</BinarySecurityToken>
        </RequestedSecurityToken>
        <RequestID xmlns="http://schemas.microsoft.com/windows/pki/2009/01/enrollment">0</RequestID>
      </RequestSecurityTokenResponse>
    </RequestSecurityTokenResponseCollection>
  </s:Body>
</s:Envelope>"#,
        message_id = escape(&message_id),
        provisioning_b64 = b64.encode(provisioning.as_bytes()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_store::{HostSeed, InMemoryStore};

    const SERVER_URL: &str = "https://mdm.example.com";

    fn discovery_body(email: &str) -> String {
        format!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing">
  <s:Header><a:MessageID>urn:uuid:m1</a:MessageID></s:Header>
  <s:Body><Discover><request><EmailAddress>{email}</EmailAddress></request></Discover></s:Body>
</s:Envelope>"#
        )
    }

    async fn windows_host(store: &InMemoryStore, node_key: &str) {
        let host = store
            .upsert_host(&HostSeed {
                uuid: "W1".into(),
                serial: "WSN1".into(),
                hostname: "pc-1".into(),
                platform: Platform::Windows,
            })
            .await
            .unwrap();
        store
            .set_host_node_keys(host.id, None, Some(node_key.into()))
            .await
            .unwrap();
    }

    fn enroll_body(auth_token_b64: &str, csr_b64: &str, device_type: &str) -> String {
        format!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing" xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" xmlns:ac="http://schemas.xmlsoap.org/ws/2006/12/authorization">
  <s:Header>
    <a:MessageID>urn:uuid:m3</a:MessageID>
    <wsse:Security>
      <wsse:BinarySecurityToken ValueType="{auth_type}">{auth}</wsse:BinarySecurityToken>
    </wsse:Security>
  </s:Header>
  <s:Body>
    <wst:RequestSecurityToken xmlns:wst="http://docs.oasis-open.org/ws-sx/ws-trust/200512">
      <wsse:BinarySecurityToken ValueType="{pkcs10}">{csr}</wsse:BinarySecurityToken>
      <ac:AdditionalContext>
        <ac:ContextItem Name="DeviceType"><ac:Value>{device_type}</ac:Value></ac:ContextItem>
        <ac:ContextItem Name="DeviceID"><ac:Value>AB157C3A18778F4FB21E2739066C1F27</ac:Value></ac:ContextItem>
        <ac:ContextItem Name="OSVersion"><ac:Value>10.0.19045</ac:Value></ac:ContextItem>
        <ac:ContextItem Name="DeviceName"><ac:Value>DESKTOP-1</ac:Value></ac:ContextItem>
        <ac:ContextItem Name="EnrollmentType"><ac:Value>Device</ac:Value></ac:ContextItem>
      </ac:AdditionalContext>
    </wst:RequestSecurityToken>
  </s:Body>
</s:Envelope>"#,
            auth_type = TOKEN_TYPE_DEVICE_ENROLL,
            auth = auth_token_b64,
            pkcs10 = TOKEN_TYPE_PKCS10,
            csr = csr_b64,
            device_type = device_type,
        )
    }

    fn csr_b64() -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::default();
        let csr = params.serialize_request(&key).unwrap().der().to_vec();
        base64::engine::general_purpose::STANDARD.encode(csr)
    }

    #[test]
    fn discovery_without_message_id_faults() {
        let body = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body/></s:Envelope>"#;
        assert!(matches!(
            process_discovery(SERVER_URL, body),
            Err(WindowsError::Fault { .. })
        ));
    }

    #[test]
    fn discovery_device_initiated_is_on_prem() {
        let resp = process_discovery(SERVER_URL, &discovery_body("")).unwrap();
        assert!(resp.contains("<AuthPolicy>OnPremise</AuthPolicy>"));
        assert!(!resp.contains("AuthenticationServiceUrl"));
        assert!(resp.contains("/EnrollmentServer/Policy.svc"));
        assert!(resp.contains("/EnrollmentServer/Enrollment.svc"));
        assert!(resp.contains("urn:uuid:m1"));
    }

    #[test]
    fn discovery_with_email_is_federated() {
        let resp = process_discovery(SERVER_URL, &discovery_body("user@example.com")).unwrap();
        assert!(resp.contains("<AuthPolicy>Federated</AuthPolicy>"));
        assert!(resp.contains("/EnrollmentServer/Authenticate.svc"));
    }

    #[tokio::test]
    async fn policy_with_unknown_node_key_faults() {
        let store = InMemoryStore::new();
        let token = base64::engine::general_purpose::STANDARD.encode("nope");
        let body = format!(
            r#"<s:Envelope xmlns:wsse="x"><wsse:BinarySecurityToken ValueType="{}">{}</wsse:BinarySecurityToken></s:Envelope>"#,
            TOKEN_TYPE_DEVICE_ENROLL, token
        );
        let err = process_policy(&store, &body).await.unwrap_err();
        assert!(err.to_string().contains("host data cannot be found"));
    }

    #[tokio::test]
    async fn policy_for_non_windows_host_faults() {
        let store = InMemoryStore::new();
        let host = store
            .upsert_host(&HostSeed {
                uuid: "M1".into(),
                serial: "MSN1".into(),
                hostname: "mac".into(),
                platform: Platform::Darwin,
            })
            .await
            .unwrap();
        store
            .set_host_node_keys(host.id, None, Some("orbit-key".into()))
            .await
            .unwrap();
        let token = base64::engine::general_purpose::STANDARD.encode("orbit-key");
        let body = format!(
            r#"<x xmlns:wsse="x"><wsse:BinarySecurityToken ValueType="{}">{}</wsse:BinarySecurityToken></x>"#,
            TOKEN_TYPE_DEVICE_ENROLL, token
        );
        let err = process_policy(&store, &body).await.unwrap_err();
        assert!(err.to_string().contains("not elegible"));
    }

    #[tokio::test]
    async fn policy_with_valid_node_key_returns_oid_reference() {
        let store = InMemoryStore::new();
        windows_host(&store, "orbit-key").await;
        let token = base64::engine::general_purpose::STANDARD.encode("orbit-key");
        let body = format!(
            r#"<x xmlns:wsse="x"><a:MessageID xmlns:a="y">m2</a:MessageID><wsse:BinarySecurityToken ValueType="{}">{}</wsse:BinarySecurityToken></x>"#,
            TOKEN_TYPE_DEVICE_ENROLL, token
        );
        let resp = process_policy(&store, &body).await.unwrap();
        assert!(resp.contains("policyOIDReference"));
        assert!(resp.contains("<minimalKeyLength>2048</minimalKeyLength>"));
        assert!(resp.contains("validityPeriodSeconds"));
    }

    #[tokio::test]
    async fn enrollment_issues_cert_and_persists_device() {
        let store = InMemoryStore::new();
        windows_host(&store, "orbit-key").await;
        let ca = CertificateAuthority::generate("WSTEP CA", "Shepherd").unwrap();
        let token = base64::engine::general_purpose::STANDARD.encode("orbit-key");
        let body = enroll_body(&token, &csr_b64(), "CIMClient_Windows");

        let resp = process_enrollment(&store, &ca, SERVER_URL, &body).await.unwrap();
        assert!(resp.contains("RequestSecurityTokenResponseCollection"));

        let enrollment = store
            .get_windows_enrollment("AB157C3A18778F4FB21E2739066C1F27")
            .await
            .unwrap()
            .expect("enrollment persisted");
        assert_eq!(enrollment.enroll_type, WindowsEnrollType::Programmatic);
        assert_eq!(enrollment.host_uuid.as_deref(), Some("W1"));
        assert_eq!(enrollment.device_name, "DESKTOP-1");

        let activities = store.list_activities(10).await.unwrap();
        assert!(activities
            .iter()
            .any(|a| matches!(a, Activity::MdmEnrolled { platform: Platform::Windows, .. })));
    }

    #[tokio::test]
    async fn enrollment_without_device_type_faults() {
        let store = InMemoryStore::new();
        windows_host(&store, "orbit-key").await;
        let ca = CertificateAuthority::generate("WSTEP CA", "Shepherd").unwrap();
        let token = base64::engine::general_purpose::STANDARD.encode("orbit-key");
        let body = enroll_body(&token, &csr_b64(), "").replace(
            r#"<ac:ContextItem Name="DeviceType"><ac:Value></ac:Value></ac:ContextItem>"#,
            "",
        );
        let err = process_enrollment(&store, &ca, SERVER_URL, &body)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DeviceType"));
    }
}
