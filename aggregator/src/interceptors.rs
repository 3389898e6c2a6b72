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

//! Bearer-token propagation across both RPC boundaries the Aggregator sits
//! between: [`extract_bearer`] is the same ingress half the Agent uses
//! (request-metadata-to-extensions), and [`BearerInterceptor`] is the
//! egress half — re-presenting the caller's token (read back out of those
//! extensions) on every outbound per-peer call. No ambient thread-local
//! storage; the token travels explicitly.

use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// The caller's bearer token, attached to a request's extensions by
/// [`extract_bearer`].
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

/// Server-side interceptor: copies the `authorization` metadata value into
/// the request's extensions under a well-known type. Never rejects a call
/// outright — an empty/missing token is accepted by the transport and only
/// fails later, at the permission check on each Agent peer.
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

#[derive(Clone)]
pub struct BearerInterceptor {
    token: String,
}

impl BearerInterceptor {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

impl Interceptor for BearerInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if !self.token.is_empty() {
            let value = MetadataValue::try_from(&self.token)
                .map_err(|_| Status::invalid_argument("bearer token is not valid metadata"))?;
            request.metadata_mut().insert("authorization", value);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_copies_authorization_header_into_extensions() {
        let mut req = Request::new(());
        req.metadata_mut()
            .insert("authorization", "Bearer abc123".parse().unwrap());

        let req = extract_bearer(req).unwrap();
        let token = req.extensions().get::<BearerToken>().unwrap();
        assert_eq!(token.0, "Bearer abc123");
    }

    #[test]
    fn attaches_non_empty_token() {
        let mut interceptor = BearerInterceptor::new("abc123".to_owned());
        let request = interceptor.call(Request::new(())).unwrap();
        assert_eq!(
            request.metadata().get("authorization").unwrap().to_str().unwrap(),
            "abc123"
        );
    }

    #[test]
    fn leaves_metadata_untouched_for_empty_token() {
        let mut interceptor = BearerInterceptor::new(String::new());
        let request = interceptor.call(Request::new(())).unwrap();
        assert!(request.metadata().get("authorization").is_none());
    }
}
