//! Kubernetes device plugin API messages.
//!
//! Field numbers follow `k8s.io/kubelet/pkg/apis/deviceplugin/v1beta1`.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod deviceplugin {
    pub mod v1beta1 {
        use std::collections::HashMap;

        pub const HEALTHY: &str = "Healthy";

        #[derive(Clone, Copy, PartialEq, ::prost::Message)]
        pub struct DevicePluginOptions {
            #[prost(bool, tag = "1")]
            pub pre_start_required: bool,
            #[prost(bool, tag = "2")]
            pub get_preferred_allocation_available: bool,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ListAndWatchResponse {
            #[prost(message, repeated, tag = "1")]
            pub devices: Vec<Device>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct TopologyInfo {
            #[prost(message, repeated, tag = "1")]
            pub nodes: Vec<NumaNode>,
        }

        #[derive(Clone, Copy, PartialEq, ::prost::Message)]
        pub struct NumaNode {
            #[prost(int64, tag = "1")]
            pub id: i64,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Device {
            #[prost(string, tag = "1")]
            pub id: String,
            /// [`HEALTHY`] or `"Unhealthy"`.
            #[prost(string, tag = "2")]
            pub health: String,
            #[prost(message, optional, tag = "3")]
            pub topology: Option<TopologyInfo>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct PreStartContainerRequest {
            #[prost(string, repeated, tag = "1")]
            pub devices_ids: Vec<String>,
        }

        #[derive(Clone, Copy, PartialEq, ::prost::Message)]
        pub struct PreStartContainerResponse {}

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct PreferredAllocationRequest {
            #[prost(message, repeated, tag = "1")]
            pub container_requests: Vec<ContainerPreferredAllocationRequest>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ContainerPreferredAllocationRequest {
            #[prost(string, repeated, tag = "1")]
            pub available_device_ids: Vec<String>,
            #[prost(string, repeated, tag = "2")]
            pub must_include_device_ids: Vec<String>,
            #[prost(int32, tag = "3")]
            pub allocation_size: i32,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct PreferredAllocationResponse {
            #[prost(message, repeated, tag = "1")]
            pub container_responses: Vec<ContainerPreferredAllocationResponse>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ContainerPreferredAllocationResponse {
            #[prost(string, repeated, tag = "1")]
            pub device_ids: Vec<String>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct AllocateRequest {
            #[prost(message, repeated, tag = "1")]
            pub container_requests: Vec<ContainerAllocateRequest>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ContainerAllocateRequest {
            #[prost(string, repeated, tag = "1")]
            pub devices_ids: Vec<String>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct AllocateResponse {
            #[prost(message, repeated, tag = "1")]
            pub container_responses: Vec<ContainerAllocateResponse>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ContainerAllocateResponse {
            #[prost(map = "string, string", tag = "1")]
            pub envs: HashMap<String, String>,
            #[prost(message, repeated, tag = "2")]
            pub mounts: Vec<Mount>,
            #[prost(message, repeated, tag = "3")]
            pub devices: Vec<DeviceSpec>,
            #[prost(map = "string, string", tag = "4")]
            pub annotations: HashMap<String, String>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Mount {
            #[prost(string, tag = "1")]
            pub container_path: String,
            #[prost(string, tag = "2")]
            pub host_path: String,
            #[prost(bool, tag = "3")]
            pub read_only: bool,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct DeviceSpec {
            #[prost(string, tag = "1")]
            pub container_path: String,
            #[prost(string, tag = "2")]
            pub host_path: String,
            /// cgroup permissions: any combination of `r`, `w` and `m`.
            #[prost(string, tag = "3")]
            pub permissions: String,
        }

        impl Device {
            pub fn healthy(id: impl Into<String>) -> Self {
                Self {
                    id: id.into(),
                    health: HEALTHY.to_string(),
                    topology: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::deviceplugin::v1beta1::*;
    use prost::Message;

    #[test]
    fn test_device_wire_format() {
        let device = Device::healthy("eth0Mvp0");
        let bytes = device.encode_to_vec();
        // field 1 (string) then field 2 (string)
        assert_eq!(bytes[0], 0x0a);
        assert_eq!(bytes[1] as usize, "eth0Mvp0".len());
        assert_eq!(Device::decode(bytes.as_slice()).unwrap(), device);
    }

    #[test]
    fn test_allocate_response_maps() {
        let mut resp = ContainerAllocateResponse::default();
        resp.envs.insert("K".into(), "V".into());
        resp.devices.push(DeviceSpec {
            container_path: "/dev/tap7".into(),
            host_path: "/dev/tap7".into(),
            permissions: "rw".into(),
        });
        let decoded =
            ContainerAllocateResponse::decode(resp.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.envs.get("K").map(String::as_str), Some("V"));
        assert_eq!(decoded.devices[0].permissions, "rw");
    }

    #[test]
    fn test_empty_list_encodes_to_nothing() {
        assert!(ListAndWatchResponse::default().encode_to_vec().is_empty());
    }
}
