// Copyright 2026 BadCompany
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

//! JSON-RPC peers on top of a [`Transport`](crate::transport::Transport).
//!
//! - [`client::UpstreamClient`] talks to the real server (the child process).
//! - [`endpoint::RpcEndpoint`] answers one downstream client.
//! - [`factory::EndpointFactory`] builds a wired endpoint per session.

pub mod client;
pub mod endpoint;
pub mod factory;

pub use client::{RpcClient, UpstreamClient};
pub use endpoint::RpcEndpoint;
pub use factory::{EndpointFactory, ProcessPerEndpoint, SharedUpstream};
