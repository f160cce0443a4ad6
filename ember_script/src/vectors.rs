//! Inline value types scripts may construct and persist.
//!
//! Unlike typed handles these own their payload; the archival engine
//! deduplicates them by identity through the same id-table mechanism as
//! tables, so two fields referencing one vector stay one vector after a
//! round trip.

use mlua::{
    AnyUserData, Error as LuaError, Lua, MetaMethod, Result as LuaResult, UserData,
    UserDataFields, UserDataMethods,
};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Quaternion {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub cells: [[f32; 4]; 4],
}

impl Default for Matrix {
    fn default() -> Self {
        let mut cells = [[0.0; 4]; 4];
        for i in 0..4 {
            cells[i][i] = 1.0;
        }
        Matrix { cells }
    }
}

impl UserData for Vec2 {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("x", |_, this| Ok(this.x));
        fields.add_field_method_set("x", |_, this, value: f32| {
            this.x = value;
            Ok(())
        });
        fields.add_field_method_get("y", |_, this| Ok(this.y));
        fields.add_field_method_set("y", |_, this, value: f32| {
            this.y = value;
            Ok(())
        });
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Add, |_, this, other: AnyUserData| {
            let other = other.borrow::<Vec2>()?;
            Ok(Vec2 {
                x: this.x + other.x,
                y: this.y + other.y,
            })
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("vec2({}, {})", this.x, this.y))
        });
    }
}

impl UserData for Vec3 {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("x", |_, this| Ok(this.x));
        fields.add_field_method_set("x", |_, this, value: f32| {
            this.x = value;
            Ok(())
        });
        fields.add_field_method_get("y", |_, this| Ok(this.y));
        fields.add_field_method_set("y", |_, this, value: f32| {
            this.y = value;
            Ok(())
        });
        fields.add_field_method_get("z", |_, this| Ok(this.z));
        fields.add_field_method_set("z", |_, this, value: f32| {
            this.z = value;
            Ok(())
        });
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Add, |_, this, other: AnyUserData| {
            let other = other.borrow::<Vec3>()?;
            Ok(Vec3 {
                x: this.x + other.x,
                y: this.y + other.y,
                z: this.z + other.z,
            })
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("vec3({}, {}, {})", this.x, this.y, this.z))
        });
    }
}

impl UserData for Quaternion {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("x", |_, this| Ok(this.x));
        fields.add_field_method_get("y", |_, this| Ok(this.y));
        fields.add_field_method_get("z", |_, this| Ok(this.z));
        fields.add_field_method_get("w", |_, this| Ok(this.w));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!(
                "quaternion({}, {}, {}, {})",
                this.x, this.y, this.z, this.w
            ))
        });
    }
}

impl UserData for Matrix {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("get", |_, this, (row, col): (usize, usize)| {
            cell_index(row, col).map(|(row, col)| this.cells[row][col])
        });
        methods.add_method_mut("set", |_, this, (row, col, value): (usize, usize, f32)| {
            let (row, col) = cell_index(row, col)?;
            this.cells[row][col] = value;
            Ok(())
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("matrix({:?})", this.cells))
        });
    }
}

fn cell_index(row: usize, col: usize) -> LuaResult<(usize, usize)> {
    if !(1..=4).contains(&row) || !(1..=4).contains(&col) {
        return Err(LuaError::RuntimeError(format!(
            "matrix cell ({row}, {col}) is out of range"
        )));
    }
    Ok((row - 1, col - 1))
}

/// Installs the constructor globals scripts use to build inline values.
pub(crate) fn install_constructors(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set(
        "vec2",
        lua.create_function(|_, (x, y): (Option<f32>, Option<f32>)| {
            Ok(Vec2 {
                x: x.unwrap_or_default(),
                y: y.unwrap_or_default(),
            })
        })?,
    )?;
    globals.set(
        "vec3",
        lua.create_function(
            |_, (x, y, z): (Option<f32>, Option<f32>, Option<f32>)| {
                Ok(Vec3 {
                    x: x.unwrap_or_default(),
                    y: y.unwrap_or_default(),
                    z: z.unwrap_or_default(),
                })
            },
        )?,
    )?;
    globals.set(
        "quaternion",
        lua.create_function(
            |_, (x, y, z, w): (Option<f32>, Option<f32>, Option<f32>, Option<f32>)| {
                let default = Quaternion::default();
                Ok(Quaternion {
                    x: x.unwrap_or(default.x),
                    y: y.unwrap_or(default.y),
                    z: z.unwrap_or(default.z),
                    w: w.unwrap_or(default.w),
                })
            },
        )?,
    )?;
    globals.set(
        "matrix",
        lua.create_function(|_, ()| Ok(Matrix::default()))?,
    )?;
    Ok(())
}
