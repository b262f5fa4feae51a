/*
 * Created on Wed Mar 12 2025
 *
 * This file is a part of Vigil
 * Vigil is a free and open-source centralized audit log receiver that
 * records privileged command sessions into durable, relayable artifacts
 * without compromising on integrity or operability.
 *
 * Copyright (c) 2025, The Vigil Authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

pub mod os;

use std::process;

const EXITCODE_ONE: i32 = 0x01;

pub fn exit_error() -> ! {
    process::exit(EXITCODE_ONE)
}
