//! Extcall table: native functions bound to `extern` defs by name and arity.

use super::error::LmntError;

/// A native extcall implemented in Rust.
pub type NativeExtcall = fn(info: &ExtcallInfo, args: &[f32], rvals: &mut [f32]) -> Result<(), LmntError>;

/// A native extcall behind the C ABI. Returns `0` on success, or a negative
/// error code.
pub type ForeignExtcall = unsafe extern "C" fn(args: *const f32, args_count: u16, rvals: *mut f32, rvals_count: u16) -> i32;

#[derive(Debug, Clone, Copy)]
pub enum ExtcallFunction {
    Native(NativeExtcall),
    Foreign(ForeignExtcall),
}

#[derive(Debug, Clone)]
pub struct ExtcallInfo {
    pub name: String,
    pub args_count: u16,
    pub rvals_count: u16,
    pub function: ExtcallFunction,
}

impl ExtcallInfo {
    pub fn native(name: &str, args_count: u16, rvals_count: u16, function: NativeExtcall) -> Self {
        ExtcallInfo { name: name.to_string(), args_count, rvals_count, function: ExtcallFunction::Native(function) }
    }

    pub fn foreign(name: &str, args_count: u16, rvals_count: u16, function: ForeignExtcall) -> Self {
        ExtcallInfo { name: name.to_string(), args_count, rvals_count, function: ExtcallFunction::Foreign(function) }
    }

    /// Invoke the extcall. `args` and `rvals` must hold at least
    /// `args_count` and `rvals_count` values.
    pub fn call(&self, args: &[f32], rvals: &mut [f32]) -> Result<(), LmntError> {
        let args = args.get(..self.args_count as usize).ok_or(LmntError::ArgsMismatch)?;
        let rvals = rvals.get_mut(..self.rvals_count as usize).ok_or(LmntError::RvalsMismatch)?;
        match self.function {
            ExtcallFunction::Native(f) => f(self, args, rvals),
            ExtcallFunction::Foreign(f) => {
                // SAFETY: both windows were bounds-checked against the declared counts above.
                let code = unsafe { f(args.as_ptr(), self.args_count, rvals.as_mut_ptr(), self.rvals_count) };
                match LmntError::from_code(code) {
                    None if code >= 0 => Ok(()),
                    None => Err(LmntError::Extcall(code)),
                    Some(err) => Err(err),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtcallTable {
    entries: Vec<ExtcallInfo>,
}

impl ExtcallTable {
    pub fn new(entries: Vec<ExtcallInfo>) -> Self {
        ExtcallTable { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, info: ExtcallInfo) -> usize {
        self.entries.push(info);
        self.entries.len() - 1
    }

    /// Index of the extcall matching `(name, args_count, rvals_count)`.
    pub fn find_index(&self, name: &str, args_count: u16, rvals_count: u16) -> Result<usize, LmntError> {
        self.entries
            .iter()
            .position(|e| e.name == name && e.args_count == args_count && e.rvals_count == rvals_count)
            .ok_or(LmntError::NotFound)
    }

    pub fn find(&self, name: &str, args_count: u16, rvals_count: u16) -> Result<&ExtcallInfo, LmntError> {
        self.find_index(name, args_count, rvals_count).map(|i| &self.entries[i])
    }

    pub fn get(&self, index: usize) -> Result<&ExtcallInfo, LmntError> {
        self.entries.get(index).ok_or(LmntError::NotFound)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtcallInfo> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadruple(_: &ExtcallInfo, args: &[f32], rvals: &mut [f32]) -> Result<(), LmntError> {
        rvals[0] = args[0] * 4.0;
        Ok(())
    }

    unsafe extern "C" fn failing(_: *const f32, _: u16, _: *mut f32, _: u16) -> i32 {
        -123456789
    }

    #[test]
    fn test_find_by_arity() {
        let table = ExtcallTable::new(vec![
            ExtcallInfo::native("f", 1, 1, quadruple),
            ExtcallInfo::native("f", 2, 1, quadruple),
        ]);
        assert_eq!(table.find_index("f", 2, 1), Ok(1));
        assert_eq!(table.find_index("f", 1, 2), Err(LmntError::NotFound));
        assert_eq!(table.find_index("g", 1, 1), Err(LmntError::NotFound));
        assert!(table.get(2).is_err());
    }

    #[test]
    fn test_call() {
        let info = ExtcallInfo::native("f", 1, 1, quadruple);
        let mut out = [0.0];
        info.call(&[2.5], &mut out).unwrap();
        assert_eq!(out[0], 10.0);
        assert_eq!(info.call(&[], &mut out), Err(LmntError::ArgsMismatch));
    }

    #[test]
    fn test_foreign_error_code() {
        let info = ExtcallInfo::foreign("bad", 0, 0, failing);
        assert_eq!(info.call(&[], &mut []), Err(LmntError::Extcall(-123456789)));
    }
}
