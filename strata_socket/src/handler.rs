//! Typed event handlers.
//!
//! The wire gives us an argument list - JSON values interleaved with binary
//! attachments. Handlers declare plain Rust parameter tuples and get them
//! bound positionally: [`FromArg`] is implemented for the allowed kinds
//! only (primitives, strings, JSON collections, [`Payload`] for binary,
//! [`Json`] for arbitrary deserializable structs), so a disallowed
//! parameter kind is a compile error rather than a registration-time
//! assertion. Variadic handlers take `Vec<serde_json::Value>`; the raw
//! escape hatch takes [`Args`] unparsed.
//!
//! Handler return values become the acknowledgment reply when the incoming
//! event carried an ack id - `()` for no values, a tuple for several.
//!
//! Panics inside a handler are contained and surfaced as
//! [`DispatchError::HandlerPanic`]; one misbehaving handler cannot take
//! down a session.

use std::{collections::HashMap, marker::PhantomData, panic::AssertUnwindSafe};

use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{
    error::{ArgsError, DispatchError},
    packet::Arg,
    socket::Socket,
};

/// A binary-capable argument: travels as an attachment, not as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

/// Wrapper binding an argument to any (de)serializable struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

/// The raw argument list of one EVENT/ACK, unparsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    /// Arguments in wire order, event name already stripped.
    pub args: Vec<Arg>,
}

impl Args {
    /// Wrap an argument list.
    #[must_use]
    pub const fn new(args: Vec<Arg>) -> Self {
        Self { args }
    }

    /// Bind the arguments to a declared parameter tuple.
    ///
    /// # Errors
    ///
    /// Fails when there are fewer arguments than parameters, or an argument
    /// does not convert into its parameter's type.
    pub fn parse<T: FromArgs>(&self) -> Result<T, ArgsError> {
        T::from_args(&self.args)
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

// ─── Inbound: wire argument → parameter type ─────────────────────────────────

/// A type an argument position can bind to.
pub trait FromArg: Sized {
    /// Convert the argument at `index`.
    ///
    /// # Errors
    ///
    /// Fails when the argument's shape does not match the declared type.
    fn from_arg(arg: &Arg, index: usize) -> Result<Self, ArgsError>;
}

impl FromArg for Payload {
    fn from_arg(arg: &Arg, index: usize) -> Result<Self, ArgsError> {
        match arg {
            Arg::Binary(data) => Ok(Self(data.clone())),
            Arg::Value(_) => Err(ArgsError::ExpectedBinary(index)),
        }
    }
}

impl<T: DeserializeOwned> FromArg for Json<T> {
    fn from_arg(arg: &Arg, index: usize) -> Result<Self, ArgsError> {
        match arg {
            Arg::Value(value) => serde_json::from_value(value.clone())
                .map(Json)
                .map_err(|source| ArgsError::Invalid { index, source }),
            Arg::Binary(_) => Err(ArgsError::ExpectedValue(index)),
        }
    }
}

macro_rules! impl_from_arg_json {
    ($($ty:ty),+ $(,)?) => {$(
        impl FromArg for $ty {
            fn from_arg(arg: &Arg, index: usize) -> Result<Self, ArgsError> {
                match arg {
                    Arg::Value(value) => serde_json::from_value(value.clone())
                        .map_err(|source| ArgsError::Invalid { index, source }),
                    Arg::Binary(_) => Err(ArgsError::ExpectedValue(index)),
                }
            }
        }
    )+};
}

impl_from_arg_json!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    String,
    Value,
    Vec<Value>,
    HashMap<String, Value>,
);

/// A parameter list an argument list can bind to.
pub trait FromArgs: Sized {
    /// Bind the whole argument list.
    ///
    /// # Errors
    ///
    /// Fails when the arguments do not match the declared parameters.
    fn from_args(args: &[Arg]) -> Result<Self, ArgsError>;
}

impl FromArgs for () {
    fn from_args(_args: &[Arg]) -> Result<Self, ArgsError> {
        Ok(())
    }
}

/// Raw escape hatch: the argument list, unparsed.
impl FromArgs for Args {
    fn from_args(args: &[Arg]) -> Result<Self, ArgsError> {
        Ok(Self::new(args.to_vec()))
    }
}

/// Variadic form: all arguments as one slice of JSON values.
impl FromArgs for Vec<Value> {
    fn from_args(args: &[Arg]) -> Result<Self, ArgsError> {
        args.iter()
            .enumerate()
            .map(|(index, arg)| match arg {
                Arg::Value(value) => Ok(value.clone()),
                Arg::Binary(_) => Err(ArgsError::ExpectedValue(index)),
            })
            .collect()
    }
}

macro_rules! impl_from_args_tuple {
    ($($idx:tt : $name:ident),+) => {
        impl<$($name: FromArg),+> FromArgs for ($($name,)+) {
            fn from_args(args: &[Arg]) -> Result<Self, ArgsError> {
                Ok(($(
                    $name::from_arg(args.get($idx).ok_or(ArgsError::NotEnough($idx))?, $idx)?,
                )+))
            }
        }
    };
}

impl_from_args_tuple!(0: A);
impl_from_args_tuple!(0: A, 1: B);
impl_from_args_tuple!(0: A, 1: B, 2: C);
impl_from_args_tuple!(0: A, 1: B, 2: C, 3: D);
impl_from_args_tuple!(0: A, 1: B, 2: C, 3: D, 4: E);
impl_from_args_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F);
impl_from_args_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F, 6: G);
impl_from_args_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F, 6: G, 7: H);

// ─── Outbound: value → wire argument ─────────────────────────────────────────

/// A value usable as one emitted argument.
pub trait IntoArg {
    /// Convert into a wire argument.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be represented as JSON.
    fn into_arg(self) -> Result<Arg, ArgsError>;
}

impl IntoArg for Arg {
    fn into_arg(self) -> Result<Arg, ArgsError> {
        Ok(self)
    }
}

impl IntoArg for Payload {
    fn into_arg(self) -> Result<Arg, ArgsError> {
        Ok(Arg::Binary(self.0))
    }
}

impl<T: Serialize> IntoArg for Json<T> {
    fn into_arg(self) -> Result<Arg, ArgsError> {
        serde_json::to_value(self.0)
            .map(Arg::Value)
            .map_err(ArgsError::Serialize)
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Result<Arg, ArgsError> {
        Ok(Arg::Value(Value::String(self.to_owned())))
    }
}

macro_rules! impl_into_arg_json {
    ($($ty:ty),+ $(,)?) => {$(
        impl IntoArg for $ty {
            fn into_arg(self) -> Result<Arg, ArgsError> {
                serde_json::to_value(self).map(Arg::Value).map_err(ArgsError::Serialize)
            }
        }
    )+};
}

impl_into_arg_json!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    String,
    Value,
    Vec<Value>,
    HashMap<String, Value>,
);

/// A value list usable as an emitted argument list (or ack reply).
pub trait IntoArgs {
    /// Convert into wire arguments.
    ///
    /// # Errors
    ///
    /// Fails when any value cannot be represented as JSON.
    fn into_args(self) -> Result<Vec<Arg>, ArgsError>;
}

impl IntoArgs for () {
    fn into_args(self) -> Result<Vec<Arg>, ArgsError> {
        Ok(Vec::new())
    }
}

impl IntoArgs for Vec<Arg> {
    fn into_args(self) -> Result<Vec<Arg>, ArgsError> {
        Ok(self)
    }
}

macro_rules! impl_into_args_tuple {
    ($($idx:tt : $name:ident),+) => {
        impl<$($name: IntoArg),+> IntoArgs for ($($name,)+) {
            fn into_args(self) -> Result<Vec<Arg>, ArgsError> {
                Ok(vec![$(self.$idx.into_arg()?),+])
            }
        }
    };
}

impl_into_args_tuple!(0: A);
impl_into_args_tuple!(0: A, 1: B);
impl_into_args_tuple!(0: A, 1: B, 2: C);
impl_into_args_tuple!(0: A, 1: B, 2: C, 3: D);
impl_into_args_tuple!(0: A, 1: B, 2: C, 3: D, 4: E);
impl_into_args_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F);
impl_into_args_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F, 6: G);
impl_into_args_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F, 6: G, 7: H);

// ─── Handlers ────────────────────────────────────────────────────────────────

/// An installed event handler.
///
/// The returned values become the ack reply when the incoming event carried
/// an id; otherwise they are discarded.
pub trait Handler: Send + Sync + 'static {
    /// Invoke the handler for one event.
    fn call(&self, socket: Socket, args: Args) -> BoxFuture<'static, Result<Vec<Arg>, DispatchError>>;
}

pub(crate) struct SyncFn<F, A, R> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

impl<F, A, R> SyncFn<F, A, R> {
    pub(crate) const fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<F, A, R> Handler for SyncFn<F, A, R>
where
    F: Fn(Socket, A) -> R + Send + Sync + 'static,
    A: FromArgs + 'static,
    R: IntoArgs + 'static,
{
    fn call(&self, socket: Socket, args: Args) -> BoxFuture<'static, Result<Vec<Arg>, DispatchError>> {
        let parsed = match args.parse::<A>() {
            Ok(parsed) => parsed,
            Err(e) => return future::ready(Err(e.into())).boxed(),
        };
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.f)(socket, parsed))) {
            Ok(values) => values.into_args().map_err(Into::into),
            Err(_) => Err(DispatchError::HandlerPanic),
        };
        future::ready(result).boxed()
    }
}

pub(crate) struct AsyncFn<F, A, Fut> {
    f: F,
    _marker: PhantomData<fn(A) -> Fut>,
}

impl<F, A, Fut> AsyncFn<F, A, Fut> {
    pub(crate) const fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<F, A, Fut, R> Handler for AsyncFn<F, A, Fut>
where
    F: Fn(Socket, A) -> Fut + Send + Sync + 'static,
    A: FromArgs + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: IntoArgs + 'static,
{
    fn call(&self, socket: Socket, args: Args) -> BoxFuture<'static, Result<Vec<Arg>, DispatchError>> {
        let parsed = match args.parse::<A>() {
            Ok(parsed) => parsed,
            Err(e) => return future::ready(Err(e.into())).boxed(),
        };
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.f)(socket, parsed))) {
            Ok(fut) => fut,
            Err(_) => return future::ready(Err(DispatchError::HandlerPanic)).boxed(),
        };
        AssertUnwindSafe(fut)
            .catch_unwind()
            .map(|outcome| match outcome {
                Ok(values) => values.into_args().map_err(Into::into),
                Err(_) => Err(DispatchError::HandlerPanic),
            })
            .boxed()
    }
}

/// Build an argument list from a tuple of values.
///
/// # Errors
///
/// Fails when any value cannot be represented as JSON.
pub fn args<T: IntoArgs>(values: T) -> Result<Vec<Arg>, ArgsError> {
    values.into_args()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn tuple_binding_is_positional() {
        let wire = vec![
            Arg::Value("blob".into()),
            Arg::Binary(vec![1, 2]),
            Arg::Binary(vec![0xFE, 0xFF]),
        ];
        let (name, a, b): (String, Payload, Payload) =
            FromArgs::from_args(&wire).expect("bind");
        assert_eq!(name, "blob");
        assert_eq!(a.as_bytes(), &[1, 2]);
        assert_eq!(b.as_bytes(), &[0xFE, 0xFF]);
    }

    #[test]
    fn shape_mismatches_are_reported_with_position() {
        let wire = vec![Arg::Value("x".into())];
        let err = <(Payload,)>::from_args(&wire).expect_err("mismatch");
        assert!(matches!(err, ArgsError::ExpectedBinary(0)));

        let err = <(String, String)>::from_args(&wire).expect_err("missing");
        assert!(matches!(err, ArgsError::NotEnough(1)));
    }

    #[test]
    fn variadic_binding_takes_all_values() {
        let wire = vec![Arg::Value(1.into()), Arg::Value("two".into())];
        let values: Vec<Value> = FromArgs::from_args(&wire).expect("bind");
        assert_eq!(values, vec![Value::from(1), Value::from("two")]);
    }

    #[test]
    fn structs_bind_through_json() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Dummy {
            n: String,
            v: String,
        }
        let wire = vec![Arg::Value(serde_json::json!({"n": "hello", "v": "world"}))];
        let (Json(dummy),): (Json<Dummy>,) = FromArgs::from_args(&wire).expect("bind");
        assert_eq!(
            dummy,
            Dummy {
                n: "hello".into(),
                v: "world".into()
            }
        );
    }

    #[test]
    fn into_args_mixes_json_and_binary() {
        let out = args(("name", 7_u32, Payload(vec![9]))).expect("args");
        assert_eq!(out[0], Arg::Value("name".into()));
        assert_eq!(out[1], Arg::Value(7.into()));
        assert_eq!(out[2], Arg::Binary(vec![9]));
    }
}
