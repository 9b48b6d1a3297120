//! Handler metadata.
//!
//! [`HandlerMeta::new`] turns a method reference such as
//! `UserController::show` into the metadata the rest of the pipeline works
//! with: the receiver type, the method descriptor, the declared parameter
//! list and a type-erased adapter that performs the call.
//!
//! Validation happens here, at registration time. A closure, a function
//! pointer, or a free function that merely takes the receiver as its first
//! argument is rejected with a [`RegistryError`] before the server starts.

mod method;

pub use method::{Method, MethodFuture};

use std::fmt;
use std::sync::Arc;

use keel_core::{ContainerError, Instance, TypeKey};

use crate::error::{InvokeError, RegistryError, RegistryResult};
use crate::extract::{ArgValue, ParamType};

type ErasedMethod =
    Arc<dyn Fn(Instance, Vec<ArgValue>) -> Result<MethodFuture, InvokeError> + Send + Sync>;

/// Identifies a handler method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    path: &'static str,
    name: &'static str,
}

impl MethodDescriptor {
    /// Fully qualified path, e.g. `app::users::UserController::show`.
    pub fn path(&self) -> &'static str {
        self.path
    }

    /// Bare method name, e.g. `show`.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path)
    }
}

/// Immutable description of a registered handler method.
#[derive(Clone)]
pub struct HandlerMeta {
    owner: TypeKey,
    method: MethodDescriptor,
    params: Vec<ParamType>,
    invoke: ErasedMethod,
}

impl HandlerMeta {
    /// Builds metadata from a method reference, validating its shape.
    pub fn new<C, Args, M>(method: M) -> RegistryResult<Self>
    where
        C: Send + Sync + 'static,
        Args: 'static,
        M: Method<C, Args>,
    {
        let owner = TypeKey::of::<C>();
        let descriptor = describe(std::any::type_name::<M>(), owner)?;

        let invoke: ErasedMethod = Arc::new(
            move |receiver: Instance, args: Vec<ArgValue>| -> Result<MethodFuture, InvokeError> {
                let receiver = receiver
                    .downcast::<C>()
                    .map_err(|_| InvokeError::Receiver {
                        ty: owner.name(),
                        source: ContainerError::TypeMismatch { ty: owner.name() },
                    })?;
                method.invoke(receiver, args)
            },
        );

        Ok(Self {
            owner,
            method: descriptor,
            params: M::param_types(),
            invoke,
        })
    }

    /// The receiver type.
    pub fn owner(&self) -> TypeKey {
        self.owner
    }

    pub fn method(&self) -> MethodDescriptor {
        self.method
    }

    /// Declared parameter types, receiver excluded.
    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    /// Number of path-typed parameters.
    pub fn path_value_count(&self) -> usize {
        self.params.iter().filter(|ty| ty.is_path_value()).count()
    }

    /// Calls the method on a resolved receiver.
    pub fn call(&self, receiver: Instance, args: Vec<ArgValue>) -> Result<MethodFuture, InvokeError> {
        (self.invoke)(receiver, args)
    }
}

impl fmt::Debug for HandlerMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMeta")
            .field("owner", &self.owner)
            .field("method", &self.method.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Checks that `path` names a method defined on `owner`.
///
/// Function items report their path through `type_name`; closures and
/// function pointers do not have one.
fn describe(path: &'static str, owner: TypeKey) -> RegistryResult<MethodDescriptor> {
    if path.contains("{{closure}}") || path.starts_with("fn(") || path.starts_with("fn<") {
        return Err(RegistryError::NotAMethod { name: path });
    }

    let owner_name = owner.name();
    // Generic arguments print differently in method paths, so compare bare paths.
    let owner_path = strip_generics(owner_name);
    let method_path = strip_generics(path);
    let on_owner = method_path
        .strip_prefix(owner_path.as_str())
        .is_some_and(|rest| rest.starts_with("::"))
        || method_path
            .strip_prefix('<')
            .and_then(|rest| rest.strip_prefix(owner_path.as_str()))
            .is_some_and(|rest| rest.starts_with(" as "));
    if !on_owner {
        return Err(RegistryError::ForeignMethod {
            method: path,
            owner: owner_name,
        });
    }

    let name = path.rsplit("::").next().unwrap_or(path);
    Ok(MethodDescriptor { path, name })
}

/// Drops `<...>` argument lists, leaving a qualified path's own brackets.
fn strip_generics(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut depth = 0_usize;
    for (index, ch) in name.char_indices() {
        match ch {
            // A leading `<` opens a qualified path, not an argument list.
            '<' if index == 0 => out.push(ch),
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{PathValue, Query};

    struct UserController {
        prefix: &'static str,
    }

    impl UserController {
        async fn show(self: Arc<Self>, id: PathValue) -> String {
            format!("{}{}", self.prefix, id.as_str())
        }

        async fn list(self: Arc<Self>, _query: Query, _page: PathValue, _size: PathValue) {}
    }

    async fn free_function(_users: Arc<UserController>) {}

    #[test]
    fn test_method_reference_is_accepted() {
        let meta = HandlerMeta::new(UserController::show).unwrap();
        assert_eq!(meta.owner(), TypeKey::of::<UserController>());
        assert_eq!(meta.method().name(), "show");
        assert!(meta.method().path().ends_with("UserController::show"));
        assert_eq!(meta.params().len(), 1);
    }

    #[test]
    fn test_path_value_count() {
        let meta = HandlerMeta::new(UserController::list).unwrap();
        assert_eq!(meta.params().len(), 3);
        assert_eq!(meta.path_value_count(), 2);
    }

    #[test]
    fn test_closure_is_rejected() {
        let err = HandlerMeta::new(|_users: Arc<UserController>| async {}).err().unwrap();
        assert!(matches!(err, RegistryError::NotAMethod { .. }));
    }

    #[test]
    fn test_free_function_is_rejected() {
        let err = HandlerMeta::new(free_function).err().unwrap();
        assert!(matches!(err, RegistryError::ForeignMethod { .. }));
    }

    struct Repository<T> {
        rows: Vec<T>,
    }

    struct Account;

    impl<T: Send + Sync + 'static> Repository<T> {
        async fn count(self: Arc<Self>) -> String {
            self.rows.len().to_string()
        }
    }

    async fn count_accounts(repo: Arc<Repository<Account>>) -> String {
        repo.rows.len().to_string()
    }

    #[test]
    fn test_generic_owner_is_checked_without_arguments() {
        let meta = HandlerMeta::new(Repository::<Account>::count).unwrap();
        assert_eq!(meta.owner(), TypeKey::of::<Repository<Account>>());
        assert_eq!(meta.method().name(), "count");

        let err = HandlerMeta::new(count_accounts).err().unwrap();
        assert!(matches!(err, RegistryError::ForeignMethod { .. }));
    }

    #[test]
    fn test_strip_generics_keeps_qualified_paths() {
        assert_eq!(strip_generics("app::Repo<app::User>::find"), "app::Repo::find");
        assert_eq!(strip_generics("app::Repo<Vec<u8>>"), "app::Repo");
        assert_eq!(
            strip_generics("<app::Repo<u8> as app::Store>::get"),
            "<app::Repo as app::Store>::get"
        );
    }

    #[tokio::test]
    async fn test_erased_call_downcasts_receiver() {
        let meta = HandlerMeta::new(UserController::show).unwrap();
        let receiver: Instance = Arc::new(UserController { prefix: "user-" });

        let results = meta
            .call(receiver, vec![Box::new(PathValue("9".into()))])
            .unwrap()
            .await;
        let reply = results[0].as_value().unwrap();
        assert_eq!(reply.downcast_ref::<String>().unwrap(), "user-9");

        let wrong: Instance = Arc::new(0_u8);
        assert!(matches!(
            meta.call(wrong, Vec::new()).err().unwrap(),
            InvokeError::Receiver { .. }
        ));
    }
}
