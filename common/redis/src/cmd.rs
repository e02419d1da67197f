//! Command and pipeline builders.

/// Converts a value into the text form that goes on the wire.
///
/// Integers are rendered in decimal before being length-prefixed, so `42` and `"42"`
/// produce identical frames.
pub trait ToRedisArg {
    fn to_redis_arg(&self) -> Vec<u8>;
}

impl ToRedisArg for str {
    fn to_redis_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToRedisArg for String {
    fn to_redis_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl<T: ToRedisArg + ?Sized> ToRedisArg for &T {
    fn to_redis_arg(&self) -> Vec<u8> {
        (**self).to_redis_arg()
    }
}

macro_rules! integer_arg {
    ($($t:ty),*) => {
        $(
            impl ToRedisArg for $t {
                fn to_redis_arg(&self) -> Vec<u8> {
                    self.to_string().into_bytes()
                }
            }
        )*
    };
}

integer_arg!(i32, i64, u16, u32, u64, usize);

/// One command: a non-empty, ordered sequence of arguments, the first being the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
}

/// Start building a command, e.g. `cmd("SADD").arg(key).arg(42)`.
pub fn cmd(name: &str) -> Cmd {
    Cmd::new(name)
}

impl Cmd {
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![name.to_redis_arg()],
        }
    }

    pub fn arg<A: ToRedisArg>(mut self, arg: A) -> Self {
        self.args.push(arg.to_redis_arg());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToRedisArg,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.to_redis_arg()));
        self
    }

    /// Command name, upper-cased for logging and dispatch.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    pub fn arguments(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Size of the encoded frame, used to pre-size write buffers.
    pub fn encoded_len(&self) -> usize {
        let header = 1 + decimal_len(self.args.len()) + 2;
        self.args
            .iter()
            .map(|arg| 1 + decimal_len(arg.len()) + 2 + arg.len() + 2)
            .sum::<usize>()
            + header
    }
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Commands sent back to back without waiting for intermediate replies.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Cmd>,
}

pub fn pipe() -> Pipeline {
    Pipeline::default()
}

impl Pipeline {
    pub fn add(&mut self, cmd: Cmd) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn commands(&self) -> &[Cmd] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;

    #[test]
    fn test_integer_and_string_args_encode_identically() {
        let numeric = cmd("SISMEMBER").arg("usom:ids").arg(42u64);
        let textual = cmd("SISMEMBER").arg("usom:ids").arg("42");
        assert_eq!(numeric, textual);
    }

    #[test]
    fn test_name_is_uppercased() {
        assert_eq!(cmd("hgetall").arg("k").name(), "HGETALL");
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        let command = cmd("HSET")
            .arg("usom:record:1")
            .args(["url", "http://example.com/ğ"])
            .arg(1234567890u64);
        assert_eq!(command.encoded_len(), encode(&command).len());
    }

    #[test]
    fn test_pipeline_preserves_order() {
        let mut pipeline = pipe();
        pipeline.add(cmd("SADD").arg("k").arg(1));
        pipeline.add(cmd("HSET").arg("h").arg("f").arg("v"));
        let names: Vec<String> = pipeline.commands().iter().map(Cmd::name).collect();
        assert_eq!(names, vec!["SADD", "HSET"]);
        assert_eq!(pipeline.len(), 2);
    }
}
