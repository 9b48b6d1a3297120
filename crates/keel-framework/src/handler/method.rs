//! Method adapters.
//!
//! A handler is a method on a controller type whose receiver is
//! `self: Arc<Self>`:
//!
//! ```rust,ignore
//! impl UserController {
//!     async fn show(self: Arc<Self>, id: PathValue) -> Result<Json<User>, HttpError> {
//!         self.users.find(id.parse()?).map(Json).ok_or_else(|| HttpError::not_found("no such user"))
//!     }
//! }
//! ```
//!
//! [`Method`] is implemented for every such function with 0 to 16
//! parameters after the receiver.
//! Each implementation knows its declared parameter types and how to call
//! the function with type-erased arguments, so the hot path never inspects
//! types beyond one downcast per argument.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::InvokeError;
use crate::extract::{ArgValue, ParamType, Parameter};
use crate::response::{IntoResults, ReturnValue};

/// The future returned by a type-erased call.
pub type MethodFuture = BoxFuture<'static, Vec<ReturnValue>>;

/// A method of receiver type `C` taking parameters `Args`.
pub trait Method<C, Args>: Clone + Send + Sync + 'static {
    /// The declared parameter types, receiver excluded.
    fn param_types() -> Vec<ParamType>;

    /// Calls the method with `receiver` prepended to `args`.
    fn invoke(&self, receiver: Arc<C>, args: Vec<ArgValue>) -> Result<MethodFuture, InvokeError>;
}

fn take_arg<T: 'static>(
    args: &mut impl Iterator<Item = (usize, ArgValue)>,
    expected: usize,
) -> Result<T, InvokeError> {
    let (index, value) = args.next().ok_or(InvokeError::Arity { expected, got: 0 })?;
    value
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| InvokeError::ArgumentType {
            index,
            expected: std::any::type_name::<T>(),
        })
}

macro_rules! count {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count!($($tail)*) };
}

/// Macro to generate Method implementations for functions with different arities.
macro_rules! impl_method {
    (
        $($ty:ident),*
    ) => {
        #[allow(non_snake_case, unused_mut, unused_variables)]
        impl<F, Fut, C, R, $($ty,)*> Method<C, ($($ty,)*)> for F
        where
            F: Fn(Arc<C>, $($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            C: Send + Sync + 'static,
            R: IntoResults + 'static,
            $( $ty: Parameter, )*
        {
            fn param_types() -> Vec<ParamType> {
                vec![$(ParamType::of::<$ty>(),)*]
            }

            fn invoke(
                &self,
                receiver: Arc<C>,
                args: Vec<ArgValue>,
            ) -> Result<MethodFuture, InvokeError> {
                let expected = count!($($ty)*);
                if args.len() != expected {
                    return Err(InvokeError::Arity {
                        expected,
                        got: args.len(),
                    });
                }

                let mut args = args.into_iter().enumerate();
                $(
                    let $ty = take_arg::<$ty>(&mut args, expected)?;
                )*

                let fut = (self)(receiver, $($ty,)*);
                Ok(async move { fut.await.into_results() }.boxed())
            }
        }
    };
}

// 0 to 16 parameters after the receiver
impl_method!();
impl_method!(T1);
impl_method!(T1, T2);
impl_method!(T1, T2, T3);
impl_method!(T1, T2, T3, T4);
impl_method!(T1, T2, T3, T4, T5);
impl_method!(T1, T2, T3, T4, T5, T6);
impl_method!(T1, T2, T3, T4, T5, T6, T7);
impl_method!(T1, T2, T3, T4, T5, T6, T7, T8);
impl_method!(T1, T2, T3, T4, T5, T6, T7, T8, T9);
impl_method!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10);
impl_method!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11);
impl_method!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12);
impl_method!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13);
impl_method!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14);
impl_method!(
    T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15
);
impl_method!(
    T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15, T16
);
