// UPnP device description parsing.
//
// The description is namespace-qualified XML: generic UPnP elements live in
// `urn:schemas-upnp-org:device-1-0`, the Sony extension elements in
// `urn:schemas-sony-com:av`. We resolve namespaces instead of matching
// prefixes so that documents are accepted regardless of how they spell the
// `av:` prefix. Missing elements default to the empty string.

use anyhow::{Context, Result};
use quick_xml::NsReader;
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use serde::{Deserialize, Serialize};

pub const UPNP_DEVICE_NS: &[u8] = b"urn:schemas-upnp-org:device-1-0";
pub const SONY_AV_NS: &[u8] = b"urn:schemas-sony-com:av";

/// One Scalar Web service endpoint family. The RPC URL for a call is
/// `{base_url}/{service_type}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarWebService {
    pub service_type: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarWebApi {
    pub services: Vec<ScalarWebService>,
    pub liveview_url: String,
    pub default_function: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    pub friendly_name: String,
    pub version: String,
    pub webapi: ScalarWebApi,
}

pub fn parse_device_description(xml: &str) -> Result<DeviceDescription> {
    let mut reader = NsReader::from_str(xml);
    let mut desc = DeviceDescription::default();
    let mut pending_service: Option<ScalarWebService> = None;
    // (namespace, local name) of the elements enclosing the cursor.
    let mut stack: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        match reader
            .read_resolved_event()
            .context("invalid device description XML")?
        {
            (resolution, Event::Start(e)) => {
                let ns = resolved_ns(resolution);
                let local = e.local_name().as_ref().to_vec();
                if ns == SONY_AV_NS && local == b"X_ScalarWebAPI_Service" {
                    pending_service = Some(ScalarWebService::default());
                }
                stack.push((ns, local));
            }
            (_, Event::Text(t)) => {
                let Some((ns, local)) = stack.last() else {
                    continue;
                };
                let decoded = t.decode().context("bad XML text node")?;
                let text = unescape(&decoded).context("bad XML text node")?;
                let text = text.trim();
                if !text.is_empty() {
                    apply_text(&mut desc, &mut pending_service, ns, local, text);
                }
            }
            (resolution, Event::End(e)) => {
                let ns = resolved_ns(resolution);
                if ns == SONY_AV_NS && e.local_name().as_ref() == b"X_ScalarWebAPI_Service" {
                    if let Some(service) = pending_service.take() {
                        desc.webapi.services.push(service);
                    }
                }
                stack.pop();
            }
            (_, Event::Eof) => break,
            _ => {}
        }
    }
    Ok(desc)
}

fn resolved_ns(resolution: ResolveResult<'_>) -> Vec<u8> {
    match resolution {
        ResolveResult::Bound(Namespace(ns)) => ns.to_vec(),
        _ => Vec::new(),
    }
}

fn apply_text(
    desc: &mut DeviceDescription,
    pending_service: &mut Option<ScalarWebService>,
    ns: &[u8],
    local: &[u8],
    text: &str,
) {
    if ns == UPNP_DEVICE_NS {
        if local == b"friendlyName" {
            desc.friendly_name = text.to_string();
        }
    } else if ns == SONY_AV_NS {
        if local == b"X_ScalarWebAPI_Version" {
            desc.version = text.to_string();
        } else if local == b"X_ScalarWebAPI_LiveView_URL" {
            desc.webapi.liveview_url = text.to_string();
        } else if local == b"X_ScalarWebAPI_DefaultFunction" {
            desc.webapi.default_function = text.to_string();
        } else if local == b"X_ScalarWebAPI_ServiceType" {
            if let Some(service) = pending_service {
                service.service_type = text.to_string();
            }
        } else if local == b"X_ScalarWebAPI_ActionList_URL" {
            if let Some(service) = pending_service {
                service.base_url = text.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_description() {
        let desc =
            parse_device_description(include_str!("resources/test/device-description.xml"))
                .unwrap();
        assert_eq!(desc.friendly_name, "ILCE-6300");
        assert_eq!(desc.version, "1.0");
        assert_eq!(
            desc.webapi.liveview_url,
            "http://192.168.122.1:60152/liveview.JPG?%211234%21http%2dget%3a%2a%3aimage%2fjpeg%3a%2a%21%21%21%21%21"
        );
        assert_eq!(desc.webapi.default_function, "Remote Shooting");
        assert_eq!(
            desc.webapi.services,
            vec![
                ScalarWebService {
                    service_type: "guide".into(),
                    base_url: "http://192.168.122.1:10000/sony".into(),
                },
                ScalarWebService {
                    service_type: "accessControl".into(),
                    base_url: "http://192.168.122.1:10000/sony".into(),
                },
                ScalarWebService {
                    service_type: "camera".into(),
                    base_url: "http://192.168.122.1:10000/sony".into(),
                },
            ]
        );
    }

    #[test]
    fn test_missing_nodes_default_to_empty() {
        let xml = r#"<?xml version="1.0"?>
            <root xmlns="urn:schemas-upnp-org:device-1-0">
              <device><friendlyName>DSC-QX10</friendlyName></device>
            </root>"#;
        let desc = parse_device_description(xml).unwrap();
        assert_eq!(desc.friendly_name, "DSC-QX10");
        assert_eq!(desc.version, "");
        assert_eq!(desc.webapi.liveview_url, "");
        assert!(desc.webapi.services.is_empty());
    }

    #[test]
    fn test_prefix_spelling_does_not_matter() {
        let xml = r#"<?xml version="1.0"?>
            <root xmlns="urn:schemas-upnp-org:device-1-0" xmlns:sony="urn:schemas-sony-com:av">
              <device>
                <friendlyName>HDR-AS50</friendlyName>
                <sony:X_ScalarWebAPI_DeviceInfo>
                  <sony:X_ScalarWebAPI_Version>1.0</sony:X_ScalarWebAPI_Version>
                  <sony:X_ScalarWebAPI_ServiceList>
                    <sony:X_ScalarWebAPI_Service>
                      <sony:X_ScalarWebAPI_ServiceType>camera</sony:X_ScalarWebAPI_ServiceType>
                      <sony:X_ScalarWebAPI_ActionList_URL>http://10.0.0.1:10000/sony</sony:X_ScalarWebAPI_ActionList_URL>
                    </sony:X_ScalarWebAPI_Service>
                  </sony:X_ScalarWebAPI_ServiceList>
                </sony:X_ScalarWebAPI_DeviceInfo>
              </device>
            </root>"#;
        let desc = parse_device_description(xml).unwrap();
        assert_eq!(desc.version, "1.0");
        assert_eq!(desc.webapi.services.len(), 1);
        assert_eq!(desc.webapi.services[0].service_type, "camera");
    }

    #[test]
    fn test_rejects_malformed_xml() {
        assert!(parse_device_description("<root><unclosed></root>").is_err());
    }
}
