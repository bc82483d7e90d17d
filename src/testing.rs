//! Shared test fixtures.

#![allow(dead_code)]

#[cfg(unix)]
pub(crate) mod fake_engine {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// `go` handler that answers instantly with a fixed score and PV.
    pub const RESPONSIVE_GO: &str =
        "printf 'info depth 10 score cp 23 pv e2e4 e7e5\\nbestmove e2e4\\n'";

    /// `go` handler that never answers, simulating a hung engine.
    pub const HUNG_GO: &str = "sleep 600";

    /// Write a fake UCI engine shell script with a pluggable `go` handler.
    ///
    /// Speaks just enough UCI for the handshake and option probing; keep
    /// the returned tempdir alive for as long as the engine is in use.
    pub fn fake_engine(go_behavior: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fakefish.sh");
        let script = format!(
            "#!/bin/sh\n\
             while read -r line; do\n\
               case \"$line\" in\n\
                 uci*) printf 'id name FakeFish\\noption name Threads type spin default 1 min 1 max 512\\noption name Hash type spin default 16 min 1 max 33554432\\nuciok\\n' ;;\n\
                 isready*) printf 'readyok\\n' ;;\n\
                 go*) {} ;;\n\
                 quit*) exit 0 ;;\n\
               esac\n\
             done\n",
            go_behavior
        );
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (dir, path)
    }
}
