use bitflags::bitflags;

bitflags! {
    pub struct OMode: u32 {
        const RDONLY = 0x000;
        const WRONLY = 0x001;
        const RDWR   = 0x002;
        const CREATE = 0x200;
    }
}

impl OMode {
    pub fn readable(&self) -> bool {
        !self.contains(OMode::WRONLY)
    }

    pub fn writable(&self) -> bool {
        self.intersects(OMode::WRONLY | OMode::RDWR)
    }

    pub fn is_create(&self) -> bool {
        self.contains(OMode::CREATE)
    }

    pub fn is_rdonly(&self) -> bool {
        !self.intersects(OMode::WRONLY | OMode::RDWR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bits() {
        let m = OMode::RDONLY;
        assert!(m.readable() && !m.writable() && m.is_rdonly());
        let m = OMode::WRONLY | OMode::CREATE;
        assert!(!m.readable() && m.writable() && m.is_create());
        let m = OMode::RDWR;
        assert!(m.readable() && m.writable() && !m.is_rdonly());
    }
}
