// Copyright 2024 The Kubetail Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Generated protobuf/gRPC types shared by the `agent` and `aggregator`
//! binaries. Both implement the same `LogMetadataService`; the Aggregator
//! additionally uses the generated client to fan requests out to each Agent.

pub mod log_metadata {
    tonic::include_proto!("log_metadata");

    /// Encoded file descriptor set, registered with `tonic-reflection` by
    /// both binaries.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("log_metadata_descriptor");
}
