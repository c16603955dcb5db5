//! The in-image object tree: attributes, parent/sibling/child links and
//! property tables.
//!
//! Objects are 1-based; object 0 is the null sentinel (reads yield 0,
//! writes are errors). The stored object table starts with the
//! property-defaults words; the object records follow.

use crate::vm::ZMachine;

/// A property located in an object's property table.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Property {
    pub number: u8,
    pub length: usize,
    /// Address of the property data; 0 when absent
    pub addr: usize,
    /// Address of the next property's size byte
    pub next: usize,
}

impl ZMachine {
    fn defaults_count(&self) -> usize {
        if self.version <= 3 {
            31
        } else {
            63
        }
    }

    /// Address of the first object record (past the defaults table).
    fn object_tree_base(&self) -> usize {
        self.header().object_table_addr() + self.defaults_count() * 2
    }

    pub fn object_addr(&self, obj_id: u16) -> Result<usize, String> {
        if obj_id == 0 {
            return Err("object 0 has no record".to_string());
        }
        Ok(self.object_tree_base() + (obj_id as usize - 1) * self.obj_size)
    }

    /// Total object count, inferred from the convention that the first
    /// object's property table sits immediately after the last record.
    pub fn object_count(&self) -> Result<usize, String> {
        let table_end = self.object_prop_table_addr(1)?;
        Ok((table_end.saturating_sub(self.object_tree_base())) / self.obj_size)
    }

    // --- Attributes ---

    fn attr_location(&self, obj_id: u16, attr: u16) -> Result<(usize, u8), String> {
        if attr >= self.attr_width as u16 * 8 {
            return Err(format!(
                "attribute {attr} out of range for v{} (pc {:#06x})",
                self.version, self.pc
            ));
        }
        let addr = self.object_addr(obj_id)? + attr as usize / 8;
        let mask = 0x80 >> (attr % 8);
        Ok((addr, mask))
    }

    pub fn test_attr(&self, obj_id: u16, attr: u16) -> Result<bool, String> {
        if obj_id == 0 {
            return Ok(false);
        }
        let (addr, mask) = self.attr_location(obj_id, attr)?;
        Ok(self.memory.u8(addr) & mask != 0)
    }

    pub fn set_attr(&mut self, obj_id: u16, attr: u16) -> Result<(), String> {
        let (addr, mask) = self.attr_location(obj_id, attr)?;
        let byte = self.memory.u8(addr);
        self.write_u8(addr, byte | mask)
    }

    pub fn clear_attr(&mut self, obj_id: u16, attr: u16) -> Result<(), String> {
        let (addr, mask) = self.attr_location(obj_id, attr)?;
        let byte = self.memory.u8(addr);
        self.write_u8(addr, byte & !mask)
    }

    // --- Tree links ---
    // v1-3 records hold byte-wide links at +4/+5/+6; v4+ word-wide at
    // +6/+8/+10.

    fn link(&self, obj_id: u16, slot: usize) -> Result<u16, String> {
        if obj_id == 0 {
            return Ok(0);
        }
        let base = self.object_addr(obj_id)? + self.attr_width;
        if self.version <= 3 {
            Ok(self.memory.u8(base + slot) as u16)
        } else {
            Ok(self.memory.u16(base + slot * 2))
        }
    }

    fn set_link(&mut self, obj_id: u16, slot: usize, value: u16) -> Result<(), String> {
        if obj_id == 0 {
            return Err("can't relink object 0".to_string());
        }
        let base = self.object_addr(obj_id)? + self.attr_width;
        if self.version <= 3 {
            if value > 255 {
                return Err(format!("object id {value} too large for a v3 link"));
            }
            self.write_u8(base + slot, value as u8)
        } else {
            self.write_u16(base + slot * 2, value)
        }
    }

    pub fn parent(&self, obj_id: u16) -> Result<u16, String> {
        self.link(obj_id, 0)
    }

    pub fn sibling(&self, obj_id: u16) -> Result<u16, String> {
        self.link(obj_id, 1)
    }

    pub fn child(&self, obj_id: u16) -> Result<u16, String> {
        self.link(obj_id, 2)
    }

    pub fn set_parent(&mut self, obj_id: u16, parent: u16) -> Result<(), String> {
        self.set_link(obj_id, 0, parent)
    }

    pub fn set_sibling(&mut self, obj_id: u16, sibling: u16) -> Result<(), String> {
        self.set_link(obj_id, 1, sibling)
    }

    pub fn set_child(&mut self, obj_id: u16, child: u16) -> Result<(), String> {
        self.set_link(obj_id, 2, child)
    }

    /// Detach `obj_id` from its parent's child chain. Walks the sibling
    /// list iteratively; story trees can be deep.
    pub fn remove_obj(&mut self, obj_id: u16) -> Result<(), String> {
        let parent = self.parent(obj_id)?;
        if parent == 0 {
            return Ok(());
        }

        let younger = self.sibling(obj_id)?;
        let first_child = self.child(parent)?;
        if first_child == obj_id {
            self.set_child(parent, younger)?;
        } else {
            // Find the older sibling pointing at us
            let mut current = first_child;
            while current != 0 {
                let next = self.sibling(current)?;
                if next == obj_id {
                    self.set_sibling(current, younger)?;
                    break;
                }
                current = next;
            }
        }
        self.set_parent(obj_id, 0)?;
        self.set_sibling(obj_id, 0)
    }

    /// Make `obj_id` the first child of `destination`. No-op when it
    /// already is.
    pub fn insert_obj(&mut self, obj_id: u16, destination: u16) -> Result<(), String> {
        if obj_id == 0 {
            return Err("can't insert object 0".to_string());
        }
        let old_first = self.child(destination)?;
        if old_first == obj_id {
            return Ok(());
        }
        self.remove_obj(obj_id)?;
        self.set_parent(obj_id, destination)?;
        self.set_child(destination, obj_id)?;
        self.set_sibling(obj_id, old_first)
    }

    // --- Properties ---

    pub fn object_prop_table_addr(&self, obj_id: u16) -> Result<usize, String> {
        let addr = self.object_addr(obj_id)?
            + self.attr_width
            + if self.version <= 3 { 3 } else { 6 };
        Ok(self.memory.u16(addr) as usize)
    }

    pub fn object_name(&self, obj_id: u16) -> Result<String, String> {
        if obj_id == 0 {
            return Ok(String::new());
        }
        let addr = self.object_prop_table_addr(obj_id)?;
        let text_words = self.memory.u8(addr);
        if text_words == 0 {
            return Ok(String::new());
        }
        self.read_zstring(addr + 1)
    }

    /// Parse the property record whose size byte sits at `addr`.
    pub fn read_property_at(&self, addr: usize) -> Property {
        let size_byte = self.memory.u8(addr);
        if size_byte == 0 {
            return Property::default();
        }
        if self.version <= 3 {
            let length = size_byte as usize / 32 + 1;
            Property {
                number: size_byte % 32,
                length,
                addr: addr + 1,
                next: addr + 1 + length,
            }
        } else {
            let number = size_byte & 0x3F;
            if size_byte & 0x80 != 0 {
                // Two-byte header; a zero length field means 64
                let mut length = (self.memory.u8(addr + 1) & 0x3F) as usize;
                if length == 0 {
                    length = 64;
                }
                Property {
                    number,
                    length,
                    addr: addr + 2,
                    next: addr + 2 + length,
                }
            } else {
                let length = if size_byte & 0x40 != 0 { 2 } else { 1 };
                Property {
                    number,
                    length,
                    addr: addr + 1,
                    next: addr + 1 + length,
                }
            }
        }
    }

    fn first_property_addr(&self, obj_id: u16) -> Result<usize, String> {
        let table = self.object_prop_table_addr(obj_id)?;
        let name_words = self.memory.u8(table) as usize;
        Ok(table + 1 + name_words * 2)
    }

    /// Walk the descending-numbered property list for `number`. Returns
    /// the default `Property` (number 0) when absent.
    pub fn find_prop(&self, obj_id: u16, number: u8) -> Result<Property, String> {
        if number == 0 || obj_id == 0 {
            return Ok(Property::default());
        }
        let mut prop = self.read_property_at(self.first_property_addr(obj_id)?);
        while prop.number != 0 && prop.number != number {
            if number > prop.number {
                // Properties are stored in descending order; we've
                // passed where it would be.
                return Ok(Property::default());
            }
            prop = self.read_property_at(prop.next);
        }
        Ok(prop)
    }

    pub fn get_default_prop(&self, number: u8) -> Result<u16, String> {
        if number == 0 || number as usize > self.defaults_count() {
            return Err(format!("property number {number} has no default"));
        }
        let addr = self.header().object_table_addr() + (number as usize - 1) * 2;
        Ok(self.memory.u16(addr))
    }

    /// Property value, falling back to the defaults table. Lengths over
    /// 2 are not meaningful here; the first word is returned.
    pub fn get_prop_value(&self, obj_id: u16, number: u8) -> Result<u16, String> {
        let prop = self.find_prop(obj_id, number)?;
        if prop.number == 0 {
            return self.get_default_prop(number);
        }
        if prop.length == 1 {
            Ok(self.memory.u8(prop.addr) as u16)
        } else {
            Ok(self.memory.u16(prop.addr))
        }
    }

    pub fn get_prop_addr(&self, obj_id: u16, number: u8) -> Result<usize, String> {
        let prop = self.find_prop(obj_id, number)?;
        Ok(if prop.number != 0 { prop.addr } else { 0 })
    }

    /// Length of the property whose data starts at `data_addr`, read
    /// back from the size byte(s) just before it. Address 0 yields 0.
    pub fn get_prop_len(&self, data_addr: usize) -> usize {
        if data_addr == 0 {
            return 0;
        }
        let size_byte = self.memory.u8(data_addr - 1);
        if self.version <= 3 {
            size_byte as usize / 32 + 1
        } else if size_byte & 0x80 != 0 {
            match (size_byte & 0x3F) as usize {
                0 => 64,
                n => n,
            }
        } else if size_byte & 0x40 != 0 {
            2
        } else {
            1
        }
    }

    /// Property enumeration: number 0 yields the first (highest)
    /// property; otherwise the one after `number`; 0 when exhausted.
    pub fn get_next_prop(&self, obj_id: u16, number: u8) -> Result<u8, String> {
        if number == 0 {
            let prop = self.read_property_at(self.first_property_addr(obj_id)?);
            return Ok(prop.number);
        }
        let prop = self.find_prop(obj_id, number)?;
        if prop.number == 0 {
            return Err(format!(
                "get_next_prop: object {obj_id} has no property {number}"
            ));
        }
        Ok(self.read_property_at(prop.next).number)
    }

    /// Write a property in place. Only byte- and word-sized properties
    /// may be written; the record never resizes.
    pub fn put_prop(&mut self, obj_id: u16, number: u8, value: u16) -> Result<(), String> {
        let prop = self.find_prop(obj_id, number)?;
        if prop.number == 0 {
            return Err(format!(
                "put_prop: object {obj_id} has no property {number}"
            ));
        }
        match prop.length {
            1 => self.write_u8(prop.addr, value as u8),
            2 => self.write_u16(prop.addr, value),
            n => Err(format!(
                "put_prop: property {number} of object {obj_id} has length {n}"
            )),
        }
    }

    /// Box-drawing rendering of the whole object forest, for debugging
    /// and tests. Iterative (explicit work list) rather than recursive.
    pub fn render_object_tree(&self) -> Result<String, String> {
        let count = self.object_count()?;
        let mut out = String::new();
        // (object, indent, is_last, is_root) pending in render order
        let mut work: Vec<(u16, String, bool, bool)> = Vec::new();

        let roots: Vec<u16> = (1..=count as u16)
            .filter(|&n| self.parent(n).unwrap_or(0) == 0)
            .collect();
        for &root in roots.iter().rev() {
            work.push((root, String::new(), true, true));
        }

        while let Some((obj, indent, is_last, is_root)) = work.pop() {
            let name = match self.object_name(obj) {
                Ok(name) if !name.is_empty() => name,
                _ => "(no name)".to_string(),
            };
            if is_root {
                out.push_str(&format!("{name} ({obj})\n"));
            } else {
                let tree_chr = if is_last { "└" } else { "├" };
                out.push_str(&format!("{indent}{tree_chr}── {name} ({obj})\n"));
            }

            let child_indent = if is_root {
                String::new()
            } else if is_last {
                format!("{indent}    ")
            } else {
                format!("{indent}|   ")
            };

            let mut children = Vec::new();
            let mut next = self.child(obj)?;
            while next != 0 {
                children.push(next);
                next = self.sibling(next)?;
            }
            for (i, &ch) in children.iter().enumerate().rev() {
                work.push((ch, child_indent.clone(), i == children.len() - 1, false));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::test_support::test_machine;
    use crate::vm::ZMachine;

    /// Lay out a small v3 object table: defaults, four objects, property
    /// tables. Objects 2 and 3 are children of 1; 4 is a root.
    fn object_machine() -> ZMachine {
        let mut zm = test_machine(3);
        let base = 0x0200 + 31 * 2; // records start after defaults
        let m = &mut zm.memory;

        // default for property 5 is 0x0505
        m.write_u16(0x0200 + 4 * 2, 0x0505).unwrap();

        let obj = |n: usize| base + (n - 1) * 9;
        // object 1: children 2,3
        m.write_u8(obj(1) + 6, 2).unwrap();
        // object 2: parent 1, sibling 3
        m.write_u8(obj(2) + 4, 1).unwrap();
        m.write_u8(obj(2) + 5, 3).unwrap();
        // object 3: parent 1
        m.write_u8(obj(3) + 4, 1).unwrap();
        // property table pointers
        for n in 1..=4 {
            m.write_u16(obj(n) + 7, (0x02A0 + (n - 1) * 0x18) as u16).unwrap();
        }

        // object 1 property table at 0x02A0: no name, props 10 (len 2),
        // 5 (len 1), terminator
        m.write_u8(0x02A0, 0).unwrap();
        m.write_u8(0x02A1, (1 * 32 + 10) as u8).unwrap(); // prop 10, len 2
        m.write_u16(0x02A2, 0x1234).unwrap();
        m.write_u8(0x02A4, 5).unwrap(); // prop 5, len 1
        m.write_u8(0x02A5, 0x42).unwrap();
        m.write_u8(0x02A6, 0).unwrap();

        // objects 2-4: empty property tables (no name, terminator)
        for n in 2..=4 {
            let t = 0x02A0 + (n - 1) * 0x18;
            m.write_u8(t, 0).unwrap();
            m.write_u8(t + 1, 0).unwrap();
        }
        zm
    }

    #[test]
    fn test_attributes_are_independent_bits() {
        let mut zm = object_machine();
        for attr in [0u16, 7, 8, 31] {
            assert!(!zm.test_attr(1, attr).unwrap());
            zm.set_attr(1, attr).unwrap();
            assert!(zm.test_attr(1, attr).unwrap());
        }
        zm.clear_attr(1, 8).unwrap();
        assert!(!zm.test_attr(1, 8).unwrap());
        assert!(zm.test_attr(1, 0).unwrap());
        assert!(zm.test_attr(1, 7).unwrap());
        assert!(zm.test_attr(1, 31).unwrap());
    }

    #[test]
    fn test_attribute_zero_is_msb_of_first_byte() {
        let mut zm = object_machine();
        zm.set_attr(1, 0).unwrap();
        let addr = zm.object_addr(1).unwrap();
        assert_eq!(zm.memory.u8(addr), 0x80);
    }

    #[test]
    fn test_out_of_range_attribute_is_fatal() {
        let mut zm = object_machine();
        assert!(zm.test_attr(1, 32).is_err());
        assert!(zm.set_attr(1, 32).is_err());
        // v4+ widens the field to 48 attributes
        let mut zm5 = test_machine(5);
        assert!(!zm5.test_attr(1, 47).unwrap());
        assert!(zm5.clear_attr(1, 48).is_err());
    }

    #[test]
    fn test_object_zero_reads_return_zero() {
        let zm = object_machine();
        assert_eq!(zm.parent(0).unwrap(), 0);
        assert_eq!(zm.sibling(0).unwrap(), 0);
        assert_eq!(zm.child(0).unwrap(), 0);
        assert!(!zm.test_attr(0, 3).unwrap());
    }

    #[test]
    fn test_tree_links() {
        let zm = object_machine();
        assert_eq!(zm.child(1).unwrap(), 2);
        assert_eq!(zm.parent(2).unwrap(), 1);
        assert_eq!(zm.sibling(2).unwrap(), 3);
        assert_eq!(zm.parent(3).unwrap(), 1);
        assert_eq!(zm.sibling(3).unwrap(), 0);
        assert_eq!(zm.parent(4).unwrap(), 0);
    }

    #[test]
    fn test_remove_first_child() {
        let mut zm = object_machine();
        zm.remove_obj(2).unwrap();
        assert_eq!(zm.child(1).unwrap(), 3);
        assert_eq!(zm.parent(2).unwrap(), 0);
        assert_eq!(zm.sibling(2).unwrap(), 0);
    }

    #[test]
    fn test_remove_middle_sibling_relinks_older() {
        let mut zm = object_machine();
        zm.remove_obj(3).unwrap();
        assert_eq!(zm.child(1).unwrap(), 2);
        assert_eq!(zm.sibling(2).unwrap(), 0);
        assert_eq!(zm.parent(3).unwrap(), 0);
    }

    #[test]
    fn test_remove_detached_object_is_noop() {
        let mut zm = object_machine();
        zm.remove_obj(4).unwrap();
        assert_eq!(zm.parent(4).unwrap(), 0);
    }

    #[test]
    fn test_insert_makes_first_child() {
        let mut zm = object_machine();
        zm.insert_obj(4, 1).unwrap();
        assert_eq!(zm.child(1).unwrap(), 4);
        assert_eq!(zm.sibling(4).unwrap(), 2);
        assert_eq!(zm.parent(4).unwrap(), 1);
        // parent(child(n)) == n holds afterwards
        assert_eq!(zm.parent(zm.child(1).unwrap()).unwrap(), 1);
    }

    #[test]
    fn test_insert_first_child_is_noop() {
        let mut zm = object_machine();
        zm.insert_obj(2, 1).unwrap();
        assert_eq!(zm.child(1).unwrap(), 2);
        assert_eq!(zm.sibling(2).unwrap(), 3);
    }

    #[test]
    fn test_insert_reparents_across_trees() {
        let mut zm = object_machine();
        zm.insert_obj(3, 4).unwrap();
        assert_eq!(zm.parent(3).unwrap(), 4);
        assert_eq!(zm.child(4).unwrap(), 3);
        assert_eq!(zm.child(1).unwrap(), 2);
        assert_eq!(zm.sibling(2).unwrap(), 0);
    }

    #[test]
    fn test_property_lookup() {
        let zm = object_machine();
        assert_eq!(zm.get_prop_value(1, 10).unwrap(), 0x1234);
        assert_eq!(zm.get_prop_value(1, 5).unwrap(), 0x42);
        // missing property 5 on object 2 falls back to the default
        assert_eq!(zm.get_prop_value(2, 5).unwrap(), 0x0505);
    }

    #[test]
    fn test_prop_addr_and_len() {
        let zm = object_machine();
        let addr = zm.get_prop_addr(1, 10).unwrap();
        assert_eq!(addr, 0x02A2);
        assert_eq!(zm.get_prop_len(addr), 2);
        let addr5 = zm.get_prop_addr(1, 5).unwrap();
        assert_eq!(zm.get_prop_len(addr5), 1);
        assert_eq!(zm.get_prop_addr(1, 7).unwrap(), 0);
        assert_eq!(zm.get_prop_len(0), 0);
    }

    #[test]
    fn test_next_prop_enumerates_descending() {
        let zm = object_machine();
        let first = zm.get_next_prop(1, 0).unwrap();
        assert_eq!(first, 10);
        let second = zm.get_next_prop(1, first).unwrap();
        assert_eq!(second, 5);
        assert_eq!(zm.get_next_prop(1, second).unwrap(), 0);
    }

    #[test]
    fn test_put_prop_writes_in_place() {
        let mut zm = object_machine();
        zm.put_prop(1, 10, 0xBEEF).unwrap();
        assert_eq!(zm.get_prop_value(1, 10).unwrap(), 0xBEEF);
        zm.put_prop(1, 5, 0x1FF).unwrap();
        // Byte-sized slot keeps only the low byte
        assert_eq!(zm.get_prop_value(1, 5).unwrap(), 0xFF);
        assert!(zm.put_prop(1, 7, 1).is_err());
    }

    #[test]
    fn test_render_object_tree() {
        let mut zm = test_machine(3);
        let base = 0x0200 + 31 * 2;
        let m = &mut zm.memory;
        // Two objects; the first one's property table sits right after
        // the records, which is how the total count is inferred.
        m.write_u8(base + 6, 2).unwrap(); // obj 1 child = 2
        m.write_u16(base + 7, (base + 18) as u16).unwrap();
        m.write_u8(base + 9 + 4, 1).unwrap(); // obj 2 parent = 1
        m.write_u16(base + 9 + 7, (base + 24) as u16).unwrap();

        // obj 1 is named "box"; obj 2 is nameless
        let prop1 = base + 18;
        m.write_u8(prop1, 1).unwrap();
        // "box" = zchars 7, 20, 29
        m.write_u16(prop1 + 1, 0x8000 | (7 << 10) | (20 << 5) | 29)
            .unwrap();
        m.write_u8(prop1 + 3, 0).unwrap();
        let prop2 = base + 24;
        m.write_u8(prop2, 0).unwrap();
        m.write_u8(prop2 + 1, 0).unwrap();

        assert_eq!(zm.object_count().unwrap(), 2);
        let tree = zm.render_object_tree().unwrap();
        assert_eq!(tree, "box (1)\n└── (no name) (2)\n");
    }

    #[test]
    fn test_v4_property_size_bytes() {
        let mut zm = test_machine(5);
        let m = &mut zm.memory;
        // One object, property table at 0x02A0
        let base = 0x0200 + 63 * 2;
        m.write_u16(base + 12, 0x02A0).unwrap();
        m.write_u8(0x02A0, 0).unwrap();
        // prop 20, two-byte header, length 3
        m.write_u8(0x02A1, 0x80 | 20).unwrap();
        m.write_u8(0x02A2, 3).unwrap();
        m.write_u8(0x02A3, 0xAA).unwrap();
        m.write_u16(0x02A4, 0xBBCC).unwrap();
        // prop 6, one-byte header, bit 6 set -> length 2
        m.write_u8(0x02A6, 0x40 | 6).unwrap();
        m.write_u16(0x02A7, 0x0607).unwrap();
        // prop 2, one-byte header -> length 1
        m.write_u8(0x02A9, 2).unwrap();
        m.write_u8(0x02AA, 0x7E).unwrap();
        m.write_u8(0x02AB, 0).unwrap();

        let addr20 = zm.get_prop_addr(1, 20).unwrap();
        assert_eq!(addr20, 0x02A3);
        assert_eq!(zm.get_prop_len(addr20), 3);
        // over-length property: value reads the first word
        assert_eq!(zm.get_prop_value(1, 20).unwrap(), 0xAABB);
        assert_eq!(zm.get_prop_value(1, 6).unwrap(), 0x0607);
        assert_eq!(zm.get_prop_value(1, 2).unwrap(), 0x7E);
        assert_eq!(zm.get_next_prop(1, 0).unwrap(), 20);
        assert_eq!(zm.get_next_prop(1, 20).unwrap(), 6);
        assert_eq!(zm.get_next_prop(1, 6).unwrap(), 2);
        assert_eq!(zm.get_next_prop(1, 2).unwrap(), 0);
    }
}
