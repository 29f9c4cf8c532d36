//! Wire format of one webhook exchange.
//!
//! ```text
//! Request:  { uid, nodeGroups: { <id>: { nodeGroupID, maxSize, minSize, desiredSize,
//!             upcomingSize, deletingSize, nodeTemplate: { cpu, mem, gpu, labels, taints },
//!             nodeIPs: [...], priority } } }
//! Response: { uid, scaleUps: [{ nodeGroupID, desiredSize }],
//!             scaleDowns: [{ nodeGroupID, type: "NodeNum" | "NodeIPs", nodeNum, nodeIPs: [...] }] }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fleet_core::{RESOURCE_CPU, RESOURCE_GPU, RESOURCE_MEMORY, ResourceList, Taint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub uid: String,
    pub node_groups: BTreeMap<String, NodeGroupState>,
}

impl WebhookRequest {
    /// A request with a fresh uid.
    pub fn new(node_groups: BTreeMap<String, NodeGroupState>) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            node_groups,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupState {
    #[serde(rename = "nodeGroupID")]
    pub node_group_id: String,
    pub max_size: usize,
    pub min_size: usize,
    pub desired_size: usize,
    pub upcoming_size: usize,
    pub deleting_size: usize,
    pub node_template: NodeTemplate,
    /// Addresses of registered members that are not being deleted.
    #[serde(rename = "nodeIPs", default)]
    pub node_ips: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

/// Shape of a new member. CPU in millicores, memory in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub cpu: i64,
    pub mem: i64,
    pub gpu: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl NodeTemplate {
    /// Template shape from node capacity (cores and bytes).
    pub fn from_capacity(capacity: &ResourceList, labels: BTreeMap<String, String>, taints: Vec<Taint>) -> Self {
        Self {
            cpu: capacity.get(RESOURCE_CPU),
            mem: capacity.get(RESOURCE_MEMORY),
            gpu: capacity.get(RESOURCE_GPU),
            labels,
            taints,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub uid: String,
    #[serde(default)]
    pub scale_ups: Vec<ScaleUpPolicy>,
    #[serde(default)]
    pub scale_downs: Vec<ScaleDownPolicy>,
}

/// Desired combined size for one group, or for several groups joined with
/// commas (`"ng1,ng2"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpPolicy {
    #[serde(rename = "nodeGroupID")]
    pub node_group_id: String,
    pub desired_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDownType {
    /// Keep `nodeNum` nodes.
    NodeNum,
    /// Remove the listed addresses.
    #[serde(rename = "NodeIPs")]
    NodeIps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleDownPolicy {
    #[serde(rename = "nodeGroupID")]
    pub node_group_id: String,
    #[serde(rename = "type")]
    pub kind: ScaleDownType,
    #[serde(default)]
    pub node_num: usize,
    #[serde(rename = "nodeIPs", default)]
    pub node_ips: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_uses_wire_names() {
        let raw = r#"{
            "uid": "abc",
            "scaleUps": [{"nodeGroupID": "ng1,ng2", "desiredSize": 15}],
            "scaleDowns": [
                {"nodeGroupID": "ng3", "type": "NodeNum", "nodeNum": 1},
                {"nodeGroupID": "ng4", "type": "NodeIPs", "nodeIPs": ["10.0.0.1"]}
            ]
        }"#;
        let resp: WebhookResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.scale_ups[0].node_group_id, "ng1,ng2");
        assert_eq!(resp.scale_ups[0].desired_size, 15);
        assert_eq!(resp.scale_downs[0].kind, ScaleDownType::NodeNum);
        assert_eq!(resp.scale_downs[1].kind, ScaleDownType::NodeIps);
        assert_eq!(resp.scale_downs[1].node_ips, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn empty_response_has_no_policies() {
        let resp: WebhookResponse = serde_json::from_str(r#"{"uid": "abc"}"#).unwrap();
        assert!(resp.scale_ups.is_empty());
        assert!(resp.scale_downs.is_empty());
    }

    #[test]
    fn request_serializes_group_fields() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "ng1".to_string(),
            NodeGroupState {
                node_group_id: "ng1".into(),
                max_size: 10,
                min_size: 1,
                desired_size: 3,
                upcoming_size: 1,
                deleting_size: 0,
                node_template: NodeTemplate::from_capacity(
                    &ResourceList::cpu_memory(4000, 16 << 30),
                    BTreeMap::new(),
                    Vec::new(),
                ),
                node_ips: vec!["10.0.0.1".into()],
                priority: 2,
            },
        );
        let request = WebhookRequest::new(groups);
        let json = serde_json::to_value(&request).unwrap();
        let ng1 = &json["nodeGroups"]["ng1"];
        assert_eq!(ng1["nodeGroupID"], "ng1");
        assert_eq!(ng1["desiredSize"], 3);
        assert_eq!(ng1["nodeTemplate"]["cpu"], 4000);
        assert_eq!(ng1["nodeIPs"][0], "10.0.0.1");
        assert!(!request.uid.is_empty());
    }
}
