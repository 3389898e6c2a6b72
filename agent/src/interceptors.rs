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

//! Propagates the caller's bearer token across the RPC boundary. Applies to
//! both unary and streaming calls, since `tonic`'s `InterceptedService`
//! wraps the whole service regardless of RPC shape.
//!
//! The Agent only needs the ingress half: extract `authorization` from the
//! incoming call and attach it to the request as a typed extension, so
//! handlers never re-parse raw metadata. The egress half (re-presenting a
//! token on an outbound call) lives in the Aggregator, which is the side
//! that dials peers on a caller's behalf.

use tonic::{Request, Status};

/// The caller's bearer token, attached to a request's extensions by
/// [`extract_bearer`]. Absent if the call carried no `authorization` header.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

/// Server-side interceptor: copies the `authorization` metadata value into
/// the request's extensions under a well-known type. Never rejects a call
/// outright — an empty/missing token is accepted by the transport and only
/// fails later, at the permission check (§4.D), naming the namespace and verb.
pub fn extract_bearer(mut req: Request<()>) -> Result<Request<()>, Status> {
    if let Some(token) = req
        .metadata()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        req.extensions_mut().insert(BearerToken(token.to_owned()));
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_authorization_header_into_extensions() {
        let mut req = Request::new(());
        req.metadata_mut()
            .insert("authorization", "Bearer abc123".parse().unwrap());

        let req = extract_bearer(req).unwrap();
        let token = req.extensions().get::<BearerToken>().unwrap();
        assert_eq!(token.0, "Bearer abc123");
    }

    #[test]
    fn missing_header_leaves_extensions_empty() {
        let req = Request::new(());
        let req = extract_bearer(req).unwrap();
        assert!(req.extensions().get::<BearerToken>().is_none());
    }
}
