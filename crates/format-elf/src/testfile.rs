//! Builder for synthetic ELF32-BE files used by the parser tests.

struct Section {
    name: &'static str,
    sh_type: u32,
    sh_flags: u32,
    sh_addr: u32,
    sh_link: u32,
    sh_info: u32,
    sh_entsize: u32,
    data: Vec<u8>,
}

pub struct ElfBuilder {
    elf_type: u16,
    machine: u16,
    entry: u32,
    text: Option<(u32, Vec<u8>)>,
    relas: Vec<(u32, u8)>,
    symbols: Vec<(String, u32, u32)>,
    gnu_stack: Option<u32>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            elf_type: super::ET_EXEC,
            machine: super::EM_68K,
            entry: 0,
            text: None,
            relas: Vec::new(),
            symbols: Vec::new(),
            gnu_stack: None,
        }
    }

    pub fn elf_type(mut self, t: u16) -> Self {
        self.elf_type = t;
        self
    }

    pub fn machine(mut self, m: u16) -> Self {
        self.machine = m;
        self
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    pub fn text(mut self, vaddr: u32, data: Vec<u8>) -> Self {
        self.text = Some((vaddr, data));
        self
    }

    /// Add a RELA entry against the text section.
    pub fn rela(mut self, r_offset: u32, r_type: u8) -> Self {
        self.relas.push((r_offset, r_type));
        self
    }

    pub fn symbol(mut self, name: &str, value: u32, size: u32) -> Self {
        self.symbols.push((name.to_string(), value, size));
        self
    }

    pub fn gnu_stack(mut self, size: u32) -> Self {
        self.gnu_stack = Some(size);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut sections: Vec<Section> = vec![Section {
            name: "",
            sh_type: 0,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_info: 0,
            sh_entsize: 0,
            data: Vec::new(),
        }];

        let text_index = self.text.as_ref().map(|(vaddr, data)| {
            sections.push(Section {
                name: ".text",
                sh_type: 1, // SHT_PROGBITS
                sh_flags: super::SHF_ALLOC | 0x4,
                sh_addr: *vaddr,
                sh_link: 0,
                sh_info: 0,
                sh_entsize: 0,
                data: data.clone(),
            });
            sections.len() as u32 - 1
        });

        if !self.relas.is_empty() {
            let mut data = Vec::new();
            for (r_offset, r_type) in &self.relas {
                data.extend_from_slice(&r_offset.to_be_bytes());
                data.extend_from_slice(&u32::from(*r_type).to_be_bytes());
                data.extend_from_slice(&0u32.to_be_bytes()); // addend, unused
            }
            sections.push(Section {
                name: ".rela.text",
                sh_type: super::SHT_RELA,
                sh_flags: 0,
                sh_addr: 0,
                sh_link: 0,
                sh_info: text_index.unwrap_or(0),
                sh_entsize: 12,
                data,
            });
        }

        if !self.symbols.is_empty() {
            let mut strtab = vec![0u8];
            let mut symtab = vec![0u8; 16]; // null symbol
            for (name, value, size) in &self.symbols {
                let name_off = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
                symtab.extend_from_slice(&name_off.to_be_bytes());
                symtab.extend_from_slice(&value.to_be_bytes());
                symtab.extend_from_slice(&size.to_be_bytes());
                symtab.push(0x12); // global function
                symtab.push(0);
                symtab.extend_from_slice(&1u16.to_be_bytes());
            }
            let strtab_index = sections.len() as u32 + 1;
            sections.push(Section {
                name: ".symtab",
                sh_type: super::SHT_SYMTAB,
                sh_flags: 0,
                sh_addr: 0,
                sh_link: strtab_index,
                sh_info: 1,
                sh_entsize: 16,
                data: symtab,
            });
            sections.push(Section {
                name: ".strtab",
                sh_type: 3, // SHT_STRTAB
                sh_flags: 0,
                sh_addr: 0,
                sh_link: 0,
                sh_info: 0,
                sh_entsize: 0,
                data: strtab,
            });
        }

        // section-name string table, always last
        let mut shstrtab = vec![0u8];
        let mut name_offsets = vec![0u32; sections.len() + 1];
        for (i, section) in sections.iter().enumerate().skip(1) {
            name_offsets[i] = shstrtab.len() as u32;
            shstrtab.extend_from_slice(section.name.as_bytes());
            shstrtab.push(0);
        }
        name_offsets[sections.len()] = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");
        let shstrndx = sections.len() as u16;
        sections.push(Section {
            name: ".shstrtab",
            sh_type: 3,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_info: 0,
            sh_entsize: 0,
            data: shstrtab,
        });

        let phnum = usize::from(self.text.is_some()) + usize::from(self.gnu_stack.is_some());
        let phoff = 52usize;
        let mut cursor = phoff + phnum * 32;
        let mut offsets = Vec::with_capacity(sections.len());
        for section in &sections {
            offsets.push(cursor as u32);
            cursor += section.data.len();
        }
        let shoff = cursor as u32;

        let mut out = Vec::with_capacity(cursor + sections.len() * 40);
        out.extend_from_slice(&super::ELF_MAGIC);
        out.push(super::ELFCLASS32);
        out.push(super::ELFDATA2MSB);
        out.push(1); // EI_VERSION
        out.extend_from_slice(&[0u8; 9]);
        out.extend_from_slice(&self.elf_type.to_be_bytes());
        out.extend_from_slice(&self.machine.to_be_bytes());
        out.extend_from_slice(&1u32.to_be_bytes()); // e_version
        out.extend_from_slice(&self.entry.to_be_bytes());
        out.extend_from_slice(&(phoff as u32).to_be_bytes());
        out.extend_from_slice(&shoff.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // e_flags
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&32u16.to_be_bytes());
        out.extend_from_slice(&(phnum as u16).to_be_bytes());
        out.extend_from_slice(&40u16.to_be_bytes());
        out.extend_from_slice(&(sections.len() as u16).to_be_bytes());
        out.extend_from_slice(&shstrndx.to_be_bytes());

        if let Some((vaddr, data)) = &self.text {
            let text_offset = offsets[text_index.unwrap_or(0) as usize];
            push_phdr(&mut out, 1, text_offset, *vaddr, *vaddr, data.len() as u32, data.len() as u32);
        }
        if let Some(size) = self.gnu_stack {
            push_phdr(&mut out, super::PT_GNU_STACK, 0, 0, 0, 0, size);
        }

        for section in &sections {
            out.extend_from_slice(&section.data);
        }

        for (i, section) in sections.iter().enumerate() {
            out.extend_from_slice(&name_offsets[i].to_be_bytes());
            out.extend_from_slice(&section.sh_type.to_be_bytes());
            out.extend_from_slice(&section.sh_flags.to_be_bytes());
            out.extend_from_slice(&section.sh_addr.to_be_bytes());
            out.extend_from_slice(&offsets[i].to_be_bytes());
            out.extend_from_slice(&(section.data.len() as u32).to_be_bytes());
            out.extend_from_slice(&section.sh_link.to_be_bytes());
            out.extend_from_slice(&section.sh_info.to_be_bytes());
            out.extend_from_slice(&4u32.to_be_bytes()); // sh_addralign
            out.extend_from_slice(&section.sh_entsize.to_be_bytes());
        }

        out
    }
}

fn push_phdr(out: &mut Vec<u8>, p_type: u32, offset: u32, vaddr: u32, paddr: u32, filesz: u32, memsz: u32) {
    out.extend_from_slice(&p_type.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&vaddr.to_be_bytes());
    out.extend_from_slice(&paddr.to_be_bytes());
    out.extend_from_slice(&filesz.to_be_bytes());
    out.extend_from_slice(&memsz.to_be_bytes());
    out.extend_from_slice(&5u32.to_be_bytes()); // p_flags: R+X
    out.extend_from_slice(&2u32.to_be_bytes()); // p_align
}
