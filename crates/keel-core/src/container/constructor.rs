//! Constructor adapters.
//!
//! Every constructor is wrapped once, at registration time, into a uniform
//! `Fn(Vec<Instance>) -> Result<Instance, BoxError>` closure. The declared
//! dependency list is taken from the constructor's parameter types, so a
//! constructor only has to ask for what it needs:
//!
//! ```rust,ignore
//! fn user_service(db: Arc<Database>, cache: Arc<Cache>) -> UserService {
//!     UserService::new(db, cache)
//! }
//!
//! fn database(config: Arc<DbConfig>) -> anyhow::Result<Database> {
//!     Database::connect(&config.url)
//! }
//!
//! container.provide(user_service);
//! container.try_provide(database);
//! ```

use std::sync::Arc;

use super::{ConstructorSpec, Instance};
use crate::error::{BoxError, ContainerError};
use crate::types::TypeKey;

/// An infallible constructor: `Fn(Arc<A>, Arc<B>, ..) -> T`.
pub trait Provider<T, Args>: Send + Sync + 'static {
    /// Wraps the constructor into its type-erased spec.
    fn into_spec(self) -> ConstructorSpec;
}

/// A fallible constructor: `Fn(Arc<A>, Arc<B>, ..) -> Result<T, E>`.
pub trait TryProvider<T, Args>: Send + Sync + 'static {
    /// Wraps the constructor into its type-erased spec.
    fn into_spec(self) -> ConstructorSpec;
}

fn take_dependency<A: Send + Sync + 'static>(
    deps: &mut impl Iterator<Item = Instance>,
) -> Result<Arc<A>, BoxError> {
    let instance = deps.next().ok_or_else(|| -> BoxError {
        Box::new(ContainerError::MissingConstructor {
            ty: std::any::type_name::<A>(),
            required_by: None,
        })
    })?;
    instance.downcast::<A>().map_err(|_| -> BoxError {
        Box::new(ContainerError::TypeMismatch {
            ty: std::any::type_name::<A>(),
        })
    })
}

macro_rules! impl_provider {
    (
        $($ty:ident),*
    ) => {
        #[allow(non_snake_case, unused_mut, unused_variables)]
        impl<F, T, $($ty,)*> Provider<T, ($($ty,)*)> for F
        where
            F: Fn($(Arc<$ty>,)*) -> T + Send + Sync + 'static,
            T: Send + Sync + 'static,
            $( $ty: Send + Sync + 'static, )*
        {
            fn into_spec(self) -> ConstructorSpec {
                ConstructorSpec::new(
                    TypeKey::of::<T>(),
                    vec![$(TypeKey::of::<$ty>(),)*],
                    move |deps| {
                        let mut deps = deps.into_iter();
                        $(
                            let $ty = take_dependency::<$ty>(&mut deps)?;
                        )*
                        Ok(Arc::new((self)($($ty,)*)) as Instance)
                    },
                )
            }
        }

        #[allow(non_snake_case, unused_mut, unused_variables)]
        impl<F, T, E, $($ty,)*> TryProvider<T, ($($ty,)*)> for F
        where
            F: Fn($(Arc<$ty>,)*) -> Result<T, E> + Send + Sync + 'static,
            T: Send + Sync + 'static,
            E: Into<BoxError>,
            $( $ty: Send + Sync + 'static, )*
        {
            fn into_spec(self) -> ConstructorSpec {
                ConstructorSpec::new(
                    TypeKey::of::<T>(),
                    vec![$(TypeKey::of::<$ty>(),)*],
                    move |deps| {
                        let mut deps = deps.into_iter();
                        $(
                            let $ty = take_dependency::<$ty>(&mut deps)?;
                        )*
                        let value = (self)($($ty,)*).map_err(|e| -> BoxError { e.into() })?;
                        Ok(Arc::new(value) as Instance)
                    },
                )
            }
        }
    };
}

// Generate implementations for 0-12 dependencies
impl_provider!();
impl_provider!(T1);
impl_provider!(T1, T2);
impl_provider!(T1, T2, T3);
impl_provider!(T1, T2, T3, T4);
impl_provider!(T1, T2, T3, T4, T5);
impl_provider!(T1, T2, T3, T4, T5, T6);
impl_provider!(T1, T2, T3, T4, T5, T6, T7);
impl_provider!(T1, T2, T3, T4, T5, T6, T7, T8);
impl_provider!(T1, T2, T3, T4, T5, T6, T7, T8, T9);
impl_provider!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10);
impl_provider!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11);
impl_provider!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12);
