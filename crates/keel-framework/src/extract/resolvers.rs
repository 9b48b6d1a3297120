//! Built-in argument resolvers.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{Container, ExecutionContext, HttpRequest};

use super::types::{
    ArgValue, Cancellation, Headers, ParamKind, PathValue, Publisher, Query, RequestInfo,
};
use super::{ArgumentResolver, ParameterMeta};
use crate::error::ResolveError;

fn require_http<'a>(
    ctx: &'a ExecutionContext,
    param: &ParameterMeta,
) -> Result<&'a HttpRequest, ResolveError> {
    ctx.http().ok_or(ResolveError::MissingCapability {
        index: param.index,
        capability: "HTTP",
    })
}

/// Resolves [`PathValue`] from the router's positional match.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathValueResolver;

#[async_trait]
impl ArgumentResolver for PathValueResolver {
    fn supports(&self, param: &ParameterMeta) -> bool {
        matches!(param.ty.kind(), ParamKind::PathValue)
    }

    async fn resolve(
        &self,
        ctx: &ExecutionContext,
        param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError> {
        require_http(ctx, param)?;
        let missing = || ResolveError::MissingPathValue { index: param.index };
        let key = param.path_key.as_deref().ok_or_else(missing)?;
        let value = ctx.path_params().get(key).ok_or_else(missing)?.to_string();
        Ok(Box::new(PathValue(value)))
    }
}

/// Resolves [`Query`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryResolver;

#[async_trait]
impl ArgumentResolver for QueryResolver {
    fn supports(&self, param: &ParameterMeta) -> bool {
        param.is::<Query>()
    }

    async fn resolve(
        &self,
        ctx: &ExecutionContext,
        param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError> {
        let request = require_http(ctx, param)?;
        Ok(Box::new(Query(request.query().clone())))
    }
}

/// Resolves [`Headers`] for any context.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadersResolver;

#[async_trait]
impl ArgumentResolver for HeadersResolver {
    fn supports(&self, param: &ParameterMeta) -> bool {
        param.is::<Headers>()
    }

    async fn resolve(
        &self,
        ctx: &ExecutionContext,
        _param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError> {
        Ok(Box::new(Headers(ctx.headers().clone())))
    }
}

/// Resolves `Json<T>` from the HTTP body or the event payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResolver;

#[async_trait]
impl ArgumentResolver for JsonResolver {
    fn supports(&self, param: &ParameterMeta) -> bool {
        matches!(param.ty.kind(), ParamKind::Json(_))
    }

    async fn resolve(
        &self,
        ctx: &ExecutionContext,
        param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError> {
        let ParamKind::Json(decoder) = param.ty.kind() else {
            return Err(ResolveError::Unmatched {
                index: param.index,
                ty: param.type_name(),
            });
        };

        let decoded = match (ctx.http(), ctx.event()) {
            (Some(request), _) if request.body().is_empty() => {
                return Err(ResolveError::MalformedBody {
                    index: param.index,
                    reason: "empty body".into(),
                });
            }
            (Some(request), _) => decoder.decode_slice(request.body()),
            (None, Some(event)) => decoder.decode_value(event.payload().clone()),
            (None, None) => {
                return Err(ResolveError::MissingCapability {
                    index: param.index,
                    capability: "HTTP or event",
                });
            }
        };

        decoded.map_err(|err| ResolveError::MalformedBody {
            index: param.index,
            reason: err.to_string(),
        })
    }
}

/// Resolves [`EventMessage`](keel_core::EventMessage) for event contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventMessageResolver;

#[async_trait]
impl ArgumentResolver for EventMessageResolver {
    fn supports(&self, param: &ParameterMeta) -> bool {
        param.is::<keel_core::EventMessage>()
    }

    async fn resolve(
        &self,
        ctx: &ExecutionContext,
        param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError> {
        let event = ctx.event().ok_or(ResolveError::MissingCapability {
            index: param.index,
            capability: "event",
        })?;
        Ok(Box::new(event.clone()))
    }
}

/// Resolves `Inject<T>` from the container.
#[derive(Debug, Clone)]
pub struct ServiceResolver {
    container: Arc<Container>,
}

impl ServiceResolver {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }
}

#[async_trait]
impl ArgumentResolver for ServiceResolver {
    fn supports(&self, param: &ParameterMeta) -> bool {
        matches!(param.ty.kind(), ParamKind::Service(_))
    }

    async fn resolve(
        &self,
        _ctx: &ExecutionContext,
        param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError> {
        let ParamKind::Service(slot) = param.ty.kind() else {
            return Err(ResolveError::Unmatched {
                index: param.index,
                ty: param.type_name(),
            });
        };

        let service = |source| ResolveError::Service {
            index: param.index,
            source,
        };
        let instance = self.container.resolve_key(slot.key()).map_err(service)?;
        slot.wrap(instance).ok_or_else(|| {
            service(keel_core::ContainerError::TypeMismatch {
                ty: slot.key().name(),
            })
        })
    }
}

/// Resolves the base capabilities: [`Publisher`], [`Cancellation`] and
/// [`RequestInfo`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextResolver;

#[async_trait]
impl ArgumentResolver for ContextResolver {
    fn supports(&self, param: &ParameterMeta) -> bool {
        param.is::<Publisher>() || param.is::<Cancellation>() || param.is::<RequestInfo>()
    }

    async fn resolve(
        &self,
        ctx: &ExecutionContext,
        param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError> {
        if param.is::<Publisher>() {
            Ok(Box::new(Publisher(Arc::clone(ctx.sink()))))
        } else if param.is::<Cancellation>() {
            Ok(Box::new(Cancellation(ctx.cancellation().clone())))
        } else {
            Ok(Box::new(RequestInfo {
                id: ctx.id(),
                target: ctx.target(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{Inject, Json, ParamType};
    use keel_core::{EventMessage, Verb};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct NewUser {
        name: String,
    }

    struct Mailer {
        from: &'static str,
    }

    fn meta<T: crate::extract::Parameter>() -> ParameterMeta {
        ParameterMeta {
            index: 0,
            ty: ParamType::of::<T>(),
            path_key: None,
        }
    }

    #[tokio::test]
    async fn test_json_reads_http_body() {
        let ctx = ExecutionContext::for_http(Verb::POST, "/users")
            .body(r#"{"name":"ada"}"#)
            .build();
        let arg = JsonResolver.resolve(&ctx, &meta::<Json<NewUser>>()).await.unwrap();
        assert_eq!(arg.downcast::<Json<NewUser>>().unwrap().name, "ada");
    }

    #[tokio::test]
    async fn test_json_reads_event_payload() {
        let ctx = ExecutionContext::for_event("user.created", json!({"name": "grace"})).build();
        let arg = JsonResolver.resolve(&ctx, &meta::<Json<NewUser>>()).await.unwrap();
        assert_eq!(arg.downcast::<Json<NewUser>>().unwrap().name, "grace");
    }

    #[tokio::test]
    async fn test_malformed_body_is_reported() {
        let ctx = ExecutionContext::for_http(Verb::POST, "/users")
            .body("not json")
            .build();
        let err = JsonResolver
            .resolve(&ctx, &meta::<Json<NewUser>>())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ResolveError::MalformedBody { .. }));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_query_values_arrive_decoded() {
        let ctx = ExecutionContext::for_http(Verb::GET, "/search?q=a%20b&name=J%C3%BCrgen+x&tag=1&tag=2")
            .header("Accept-Language", "de")
            .build();

        let query = QueryResolver.resolve(&ctx, &meta::<Query>()).await.unwrap();
        let query = query.downcast::<Query>().unwrap();
        assert_eq!(query.get("q"), Some("a b"));
        assert_eq!(query.get("name"), Some("Jürgen x"));
        assert_eq!(query.get_all("tag"), ["1", "2"]);

        let headers = HeadersResolver.resolve(&ctx, &meta::<Headers>()).await.unwrap();
        let headers = headers.downcast::<Headers>().unwrap();
        assert_eq!(headers["accept-language"], "de");
    }

    #[tokio::test]
    async fn test_http_only_parameter_fails_on_event_context() {
        let ctx = ExecutionContext::for_event("tick", json!(null)).build();
        let err = QueryResolver.resolve(&ctx, &meta::<Query>()).await.err().unwrap();
        assert!(matches!(err, ResolveError::MissingCapability { capability: "HTTP", .. }));

        let ctx = ExecutionContext::for_http(Verb::GET, "/").build();
        let err = EventMessageResolver
            .resolve(&ctx, &meta::<EventMessage>())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ResolveError::MissingCapability { capability: "event", .. }));
    }

    #[tokio::test]
    async fn test_service_resolver_injects_singleton() {
        let mut container = Container::new();
        container.instance(Mailer { from: "noreply@keel.rs" });
        let resolver = ServiceResolver::new(Arc::new(container));

        let ctx = ExecutionContext::for_http(Verb::GET, "/").build();
        let arg = resolver.resolve(&ctx, &meta::<Inject<Mailer>>()).await.unwrap();
        assert_eq!(arg.downcast::<Inject<Mailer>>().unwrap().from, "noreply@keel.rs");
    }

    #[tokio::test]
    async fn test_missing_service_is_a_server_error() {
        let resolver = ServiceResolver::new(Arc::new(Container::new()));
        let ctx = ExecutionContext::for_http(Verb::GET, "/").build();
        let err = resolver
            .resolve(&ctx, &meta::<Inject<Mailer>>())
            .await
            .err()
            .unwrap();
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn test_request_info_describes_target() {
        let ctx = ExecutionContext::for_http(Verb::DELETE, "/users/3").build();
        let arg = ContextResolver.resolve(&ctx, &meta::<RequestInfo>()).await.unwrap();
        let info = arg.downcast::<RequestInfo>().unwrap();
        assert_eq!(info.id, ctx.id());
        assert_eq!(info.target, "DELETE /users/3");
    }
}
