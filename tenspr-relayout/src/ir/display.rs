use super::*;
use std::fmt::{self, Write};

impl Graph {
    fn fmt_region(&self, f: &mut fmt::Formatter<'_>, region: Region, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        for &op in self.region(region).ops.iter() {
            let data = self.op(op);
            write!(f, "{pad}")?;
            if !data.results.is_empty() {
                let names = data.results.iter().map(|v| format!("%{v}")).collect::<Vec<_>>();
                write!(f, "{} = ", names.join(", "))?;
            }
            write!(f, "{}", data.kind)?;
            let names = data.operands.iter().map(|v| format!("%{v}")).collect::<Vec<_>>();
            if !names.is_empty() { write!(f, " {}", names.join(", "))?; }
            match &data.kind {
                OpKind::Convert { to } => write!(f, " -> {to}")?,
                _ => {}
            }
            if !data.results.is_empty() {
                let tys = data.results.iter().map(|&v| self.value_type(v).to_string()).collect::<Vec<_>>();
                write!(f, " : {}", tys.join(", "))?;
            }
            if data.regions.is_empty() {
                writeln!(f)?;
                continue;
            }
            writeln!(f, " {{")?;
            for &nested in data.regions.iter() {
                let args = self.region(nested).args.iter()
                    .map(|&v| format!("%{v}: {}", self.value_type(v)))
                    .collect::<Vec<_>>();
                writeln!(f, "{pad}^({}):", args.join(", "))?;
                self.fmt_region(f, nested, depth + 1)?;
            }
            writeln!(f, "{pad}}}")?;
        }
        Ok(())
    }

    /// Hex-encoded sha256 of the printed graph.
    ///
    /// Equal fingerprints mean the live graph is unchanged, which is how
    /// callers check that a failed rewrite left nothing behind.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut text = String::new();
        // formatting into a String cannot fail
        let _ = write!(&mut text, "{self}");
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args().iter().map(|&v| format!("%{v}: {}", self.value_type(v))).collect::<Vec<_>>();
        writeln!(f, "func({}) {{", args.join(", "))?;
        self.fmt_region(f, self.body(), 1)?;
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn print_and_fingerprint() {
        let enc = Encoding::blocked(&[1], &[32], &[4], &[0]);
        let mut g = Graph::new();
        let x = g.arg(Type::tensor(&[128], DType::F32, enc.clone()));
        let y = g.unary(UnOp::Neg, x).unwrap();
        g.ret(&[y]).unwrap();
        let text = g.to_string();
        assert!(text.starts_with("func(%v0: tensor<128xf32, #blocked<[1], [32], [4], [0]>>) {"));
        assert!(text.contains("%v1 = neg %v0 : tensor<128xf32"));
        let before = g.fingerprint();
        assert_eq!(before.len(), 64);
        assert_eq!(before, g.clone().fingerprint());
        // a detached op does not show up
        g.create_op(OpKind::Unary(UnOp::Abs), &[x], None).unwrap();
        assert_eq!(before, g.fingerprint());
        g.convert(y, Encoding::blocked(&[4], &[32], &[4], &[0])).unwrap();
        assert_ne!(before, g.fingerprint());
    }
}
